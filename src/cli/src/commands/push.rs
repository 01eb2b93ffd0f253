//! `imgcrypt push` command - Encrypt a local image and push it to a registry.

use std::sync::Arc;

use clap::Args;
use imgcrypt_core::config::CryptConfig;
use imgcrypt_runtime::{DockerCli, ImagePusher, ImageReference, LayerSelection};

use super::CryptoArgs;

#[derive(Args)]
pub struct PushArgs {
    /// Local image (e.g., "app:v1")
    pub image: String,

    /// Destination reference (defaults to the local image name)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Select layers by diffing against the image below the marker
    #[arg(long)]
    pub base_diff: bool,

    #[command(flatten)]
    pub crypto: CryptoArgs,

    /// Only print the manifest digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, config: &CryptConfig) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.crypto.to_opts()?;
    let target = ImageReference::parse(args.target.as_deref().unwrap_or(&args.image))?;
    let selection = if args.base_diff {
        LayerSelection::BaseImage
    } else {
        LayerSelection::History
    };

    let pusher = ImagePusher::new(
        super::registry_client(config)?,
        Arc::new(DockerCli::default()),
        &config.staging_root,
        config.marker_label.as_str(),
    );

    if !args.quiet {
        println!("Pushing {} as {}...", args.image, target);
    }
    let pushed = pusher.push(&args.image, &target, &opts, selection).await?;

    if args.quiet {
        println!("{}", pushed.digest);
    } else {
        let encrypted = pushed.manifest.layers.iter().filter(|l| l.is_encrypted()).count();
        println!(
            "Pushed: {}@{} ({} of {} layers encrypted)",
            pushed.reference,
            pushed.digest,
            encrypted,
            pushed.manifest.layers.len()
        );
    }
    Ok(())
}
