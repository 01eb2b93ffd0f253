//! `imgcrypt inspect` command - Show a remote image's blobs.

use clap::Args;
use imgcrypt_core::config::CryptConfig;
use imgcrypt_runtime::{BlobEntry, ImageReference};

use crate::output::{format_bytes, new_table, short_digest};

#[derive(Args)]
pub struct InspectArgs {
    /// Image reference (e.g., "ghcr.io/org/app:v1")
    pub image: String,

    /// Print the raw manifest JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InspectArgs, config: &CryptConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    let client = super::registry_client(config)?;
    let manifest = client
        .pull_manifest(&reference, std::env::temp_dir())
        .await?;

    if args.json {
        println!("{}", String::from_utf8(manifest.to_json()?)?);
        return Ok(());
    }

    let mut table = new_table(&["BLOB", "DIGEST", "SIZE", "ENCRYPTION"]);
    table.add_row(row("config", &manifest.config));
    for (index, layer) in manifest.layers.iter().enumerate() {
        table.add_row(row(&format!("layer {}", index), layer));
    }
    println!("{}", reference);
    println!("{table}");
    println!("Total: {}", format_bytes(manifest.total_size()));
    Ok(())
}

fn row(name: &str, blob: &BlobEntry) -> Vec<String> {
    vec![
        name.to_string(),
        short_digest(&blob.digest.to_string()),
        format_bytes(blob.size),
        encryption_label(blob),
    ]
}

fn encryption_label(blob: &BlobEntry) -> String {
    match (&blob.crypto, blob.is_encrypted()) {
        (Some(crypto), _) => crypto.algorithm.to_string(),
        (None, true) => "legacy URL".to_string(),
        (None, false) => "-".to_string(),
    }
}
