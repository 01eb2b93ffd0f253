//! High-level image pull orchestrator.
//!
//! Manifest first, then every data key is unwrapped before any blob is
//! fetched, so a wrong passphrase or algorithm fails before the download.
//! Config and layers follow in manifest order. A failed pull removes its
//! staging directory.

use std::path::{Path, PathBuf};

use imgcrypt_core::error::{CryptError, Result};

use super::client::RegistryClient;
use super::reference::ImageReference;
use crate::crypto::CryptoOpts;
use crate::image::export::decrypt_image;
use crate::image::manifest::ImageManifest;

/// A pulled and decrypted image.
#[derive(Debug)]
pub struct PulledImage {
    pub reference: ImageReference,
    pub manifest: ImageManifest,
    /// `docker load`-compatible archive
    pub archive: PathBuf,
}

/// Pulls encrypted images into per-pull staging directories.
pub struct ImagePuller {
    client: RegistryClient,
    staging_root: PathBuf,
}

impl ImagePuller {
    pub fn new(client: RegistryClient, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_root: staging_root.into(),
        }
    }

    /// Pull manifest, keys, config, and layers of `reference`.
    ///
    /// The returned manifest records each blob's local file and, for encrypted
    /// blobs, the unwrapped data key.
    pub async fn pull(&self, reference: &ImageReference, opts: &CryptoOpts) -> Result<ImageManifest> {
        let dir = self.new_staging_dir()?;
        match self.pull_into(reference, opts, &dir).await {
            Ok(manifest) => Ok(manifest),
            Err(e) => Err(abort(e, &dir)),
        }
    }

    /// Pull `reference` and rebuild it as a loadable archive.
    pub async fn pull_and_decrypt(
        &self,
        reference: &ImageReference,
        opts: &CryptoOpts,
    ) -> Result<PulledImage> {
        let manifest = self.pull(reference, opts).await?;
        let dir = manifest.staging_dir.clone();

        let task_reference = reference.clone();
        let result = tokio::task::spawn_blocking(move || {
            let out = manifest.staging_dir.join("image");
            let archive = decrypt_image(&manifest, &task_reference, &out);
            (manifest, archive)
        })
        .await;

        let (mut manifest, archive) = match result {
            Ok(done) => done,
            Err(e) => {
                let e = CryptError::Other(format!("decrypt task failed: {}", e));
                return Err(abort(e, &dir));
            }
        };
        manifest.forget_keys();

        match archive {
            Ok(archive) => Ok(PulledImage {
                reference: reference.clone(),
                manifest,
                archive,
            }),
            Err(e) => Err(abort(e, &dir)),
        }
    }

    async fn pull_into(
        &self,
        reference: &ImageReference,
        opts: &CryptoOpts,
        dir: &Path,
    ) -> Result<ImageManifest> {
        let mut manifest = self.client.pull_manifest(reference, dir.to_path_buf()).await?;

        manifest.open_keys(opts, reference)?;
        tracing::info!(
            reference = %reference,
            encrypted = manifest.blobs().filter(|b| b.is_encrypted()).count(),
            "Data keys unwrapped"
        );

        tracing::info!(digest = %manifest.config.digest, "Downloading config");
        let path = self
            .client
            .pull_blob(reference, &manifest.config.digest, dir)
            .wait()
            .await?;
        manifest.config.filename = Some(path);

        for (index, layer) in manifest.layers.iter_mut().enumerate() {
            tracing::info!(index, digest = %layer.digest, size = layer.size, "Downloading layer");
            let path = self
                .client
                .pull_blob(reference, &layer.digest, dir)
                .wait()
                .await?;
            layer.filename = Some(path);
        }

        tracing::info!(
            reference = %reference,
            dir = %dir.display(),
            bytes = manifest.total_size(),
            "Image pulled"
        );
        Ok(manifest)
    }

    fn new_staging_dir(&self) -> Result<PathBuf> {
        let dir = self.staging_root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).map_err(|e| CryptError::path(&dir, e))?;
        Ok(dir)
    }
}

/// Remove the staging directory of a failed operation.
pub(crate) fn abort(err: CryptError, dir: &Path) -> CryptError {
    let cleanup = std::fs::remove_dir_all(dir)
        .err()
        .map(|e| CryptError::path(dir, e));
    tracing::debug!(dir = %dir.display(), error = %err, "Aborted, staging directory removed");
    CryptError::with_cleanup(err, [cleanup])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_file, Algorithm, DataKey};
    use crate::image::manifest::{config_salt, BlobEntry, MEDIA_TYPE_CONFIG};
    use crate::registry::RegistryAuth;
    use imgcrypt_core::config::TransferConfig;
    use imgcrypt_core::digest::Digest;
    use std::fs;
    use tempfile::TempDir;

    fn client() -> RegistryClient {
        let config = TransferConfig {
            insecure: true,
            ..Default::default()
        };
        RegistryClient::new(config, RegistryAuth::anonymous()).unwrap()
    }

    fn opts() -> CryptoOpts {
        CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false).with_passphrase("pull-test")
    }

    /// Encrypted config-only image served by `server`.
    async fn serve_image(server: &mut mockito::ServerGuard, temp: &Path) -> ImageReference {
        let reference =
            ImageReference::parse(&format!("{}/org/app:v1", server.host_with_port())).unwrap();

        let gz = temp.join("config.json.gz");
        fs::write(temp.join("config.json"), br#"{"os":"linux"}"#).unwrap();
        let (gz_path, _, _) = crate::image::compress(&temp.join("config.json")).unwrap();
        assert_eq!(gz_path, gz);

        let key = DataKey::generate().unwrap();
        let enc = temp.join("config.json.gz.aes");
        let (digest, size) = encrypt_file(&gz, &enc, &key).unwrap();
        let mut config = BlobEntry::new(MEDIA_TYPE_CONFIG, digest.clone(), size, enc.clone());
        config.plain_digest = Some(Digest::from_bytes(br#"{"os":"linux"}"#));
        config.seal_key(&key, config_salt(&reference), &opts()).unwrap();
        let manifest = ImageManifest::new(config, vec![], PathBuf::new());

        server
            .mock("GET", "/v2/org/app/manifests/v1")
            .with_status(200)
            .with_body(manifest.to_json().unwrap())
            .create_async()
            .await;
        server
            .mock("GET", format!("/v2/org/app/blobs/{}", digest).as_str())
            .with_status(200)
            .with_body(fs::read(&enc).unwrap())
            .create_async()
            .await;
        reference
    }

    #[tokio::test]
    async fn test_pull_and_decrypt() {
        let temp = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let reference = serve_image(&mut server, temp.path()).await;

        let staging = temp.path().join("staging");
        let puller = ImagePuller::new(client(), &staging);
        let pulled = puller.pull_and_decrypt(&reference, &opts()).await.unwrap();

        assert!(pulled.archive.exists());
        assert!(pulled.manifest.config.data_key.is_none());
        let config = pulled.manifest.staging_dir.join("image/config.json");
        assert_eq!(fs::read(config).unwrap(), br#"{"os":"linux"}"#);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_aborts_before_download() {
        let temp = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let reference = serve_image(&mut server, temp.path()).await;

        let staging = temp.path().join("staging");
        let puller = ImagePuller::new(client(), &staging);
        let wrong = CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false).with_passphrase("nope");
        let err = puller.pull(&reference, &wrong).await.unwrap_err();

        assert!(matches!(err, CryptError::AuthenticationError(_)));
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_algorithm_mismatch_aborts() {
        let temp = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let reference = serve_image(&mut server, temp.path()).await;

        let puller = ImagePuller::new(client(), temp.path().join("staging"));
        let none = CryptoOpts::new(Algorithm::None, false);
        let err = puller.pull(&reference, &none).await.unwrap_err();
        assert_eq!(err.to_string(), "encryption type does not match decryption type");
    }
}
