//! `imgcrypt pull` command.

use std::path::{Path, PathBuf};

use clap::Args;
use imgcrypt_core::config::CryptConfig;
use imgcrypt_runtime::{DockerCli, ImagePuller, ImageReference, ImageSource, PulledImage};

use super::CryptoArgs;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "ghcr.io/org/app:v1")
    pub image: String,

    #[command(flatten)]
    pub crypto: CryptoArgs,

    /// Copy the decrypted image archive here
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Import the decrypted image with `docker load` and remove the staging files
    #[arg(long)]
    pub load: bool,

    /// Only print the archive path
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, config: &CryptConfig) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.crypto.to_opts()?;
    let reference = ImageReference::parse(&args.image)?;
    let puller = ImagePuller::new(super::registry_client(config)?, &config.staging_root);

    if !args.quiet {
        println!("Pulling {}...", reference);
    }
    let pulled = puller.pull_and_decrypt(&reference, &opts).await?;

    // Without -o or --load the printed path points into the staging directory.
    let archive = match &args.output {
        Some(output) => {
            export_archive(&pulled, output)?;
            output.clone()
        }
        None => pulled.archive.clone(),
    };

    if args.load {
        DockerCli::default().load(&archive).await?;
        if args.output.is_none() {
            remove_staging(&pulled)?;
        }
        if !args.quiet {
            println!("Loaded: {}", reference);
        }
        return Ok(());
    }

    if args.quiet {
        println!("{}", archive.display());
    } else {
        println!("Pulled: {} ({})", reference, archive.display());
    }
    Ok(())
}

/// Copy the archive to `output` and drop the staged plaintext.
fn export_archive(pulled: &PulledImage, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::copy(&pulled.archive, output)
        .map_err(|e| format!("Failed to copy archive to {}: {}", output.display(), e))?;
    remove_staging(pulled)
}

fn remove_staging(pulled: &PulledImage) -> Result<(), Box<dyn std::error::Error>> {
    let dir = &pulled.manifest.staging_dir;
    std::fs::remove_dir_all(dir)
        .map_err(|e| format!("Failed to remove {}: {}", dir.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcrypt_core::Digest;
    use imgcrypt_runtime::image::{MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER};
    use imgcrypt_runtime::{BlobEntry, ImageManifest};
    use tempfile::TempDir;

    fn pulled(staging: &Path) -> PulledImage {
        let image = staging.join("image");
        std::fs::create_dir_all(&image).unwrap();
        std::fs::write(image.join("layer.tar"), b"decrypted layer").unwrap();
        let archive = staging.join("image.tar");
        std::fs::write(&archive, b"archive bytes").unwrap();

        let config = BlobEntry::new(
            MEDIA_TYPE_CONFIG,
            Digest::from_bytes(b"config"),
            6,
            staging.join("config.gz.aes"),
        );
        let layer = BlobEntry::new(
            MEDIA_TYPE_LAYER,
            Digest::from_bytes(b"layer"),
            5,
            staging.join("layer.gz.aes"),
        );
        PulledImage {
            reference: ImageReference::parse("ghcr.io/org/app:v1").unwrap(),
            manifest: ImageManifest::new(config, vec![layer], staging.to_path_buf()),
            archive,
        }
    }

    #[test]
    fn test_export_archive_removes_staging() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        let image = pulled(&staging);
        let output = temp.path().join("app.tar");

        export_archive(&image, &output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"archive bytes");
        assert!(!staging.exists());
    }

    #[test]
    fn test_export_archive_keeps_staging_on_copy_failure() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        let image = pulled(&staging);
        let output = temp.path().join("missing-dir").join("app.tar");

        assert!(export_archive(&image, &output).is_err());
        assert!(image.archive.exists());
    }
}
