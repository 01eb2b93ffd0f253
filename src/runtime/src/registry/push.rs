//! High-level image push orchestrator.
//!
//! Exports a local image, selects the layers built after the marker,
//! assembles the encrypted manifest, and uploads blobs then manifest.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};

use super::client::RegistryClient;
use super::pull::abort;
use super::reference::ImageReference;
use crate::crypto::CryptoOpts;
use crate::image::archive::extract_tar;
use crate::image::assemble::{assemble_manifest, read_archive_layout};
use crate::image::manifest::ImageManifest;
use crate::image::select::{base_image_id, select_by_image_diff, select_layers_to_encrypt};
use crate::image::source::ImageSource;

/// How the layers to encrypt are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LayerSelection {
    /// Count the layers history shows above the marker.
    #[default]
    History,
    /// Diff against the local image the marker was built on.
    BaseImage,
}

/// Result of a successful push.
#[derive(Debug)]
pub struct PushedImage {
    pub reference: ImageReference,
    pub digest: Digest,
    pub manifest: ImageManifest,
}

/// Pushes local images with their post-marker layers encrypted.
pub struct ImagePusher {
    client: RegistryClient,
    source: Arc<dyn ImageSource>,
    staging_root: PathBuf,
    marker: String,
}

impl ImagePusher {
    pub fn new(
        client: RegistryClient,
        source: Arc<dyn ImageSource>,
        staging_root: impl Into<PathBuf>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            client,
            source,
            staging_root: staging_root.into(),
            marker: marker.into(),
        }
    }

    /// Push local image `local` as `target`.
    pub async fn push(
        &self,
        local: &str,
        target: &ImageReference,
        opts: &CryptoOpts,
        selection: LayerSelection,
    ) -> Result<PushedImage> {
        // Key salts are derived from the tag.
        if target.tag.is_none() {
            return Err(CryptError::InvalidReference(format!(
                "{}: push target needs a tag",
                target
            )));
        }

        let dir = self.staging_root.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).map_err(|e| CryptError::path(&dir, e))?;

        let result = self.push_from(local, target, opts, selection, dir.clone()).await;
        match result {
            Ok(pushed) => {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove staging directory");
                }
                Ok(pushed)
            }
            Err(e) => Err(abort(e, &dir)),
        }
    }

    /// Layers of `local` that must be encrypted.
    pub async fn select_layers(&self, local: &str, selection: LayerSelection) -> Result<HashSet<String>> {
        let inspect = self.source.inspect(local).await?;
        let history = self.source.history(local).await?;

        match selection {
            LayerSelection::History => {
                select_layers_to_encrypt(&history, &inspect.diff_ids, &self.marker)
            }
            LayerSelection::BaseImage => {
                let base = base_image_id(&history, &self.marker)?;
                let lower = self.source.inspect(&base).await?;
                tracing::info!(base = %base, "Diffing against base image");
                Ok(select_by_image_diff(&inspect.diff_ids, &lower.diff_ids))
            }
        }
    }

    async fn push_from(
        &self,
        local: &str,
        target: &ImageReference,
        opts: &CryptoOpts,
        selection: LayerSelection,
        dir: PathBuf,
    ) -> Result<PushedImage> {
        let selected = self.select_layers(local, selection).await?;
        let inspect = self.source.inspect(local).await?;

        let archive = dir.join("image.tar");
        self.source.save(&inspect.id, &archive).await?;

        let task_opts = opts.clone();
        let task_target = target.clone();
        let manifest = tokio::task::spawn_blocking(move || {
            let unpacked = dir.join("image");
            extract_tar(&archive, &unpacked)?;
            std::fs::remove_file(&archive).map_err(|e| CryptError::path(&archive, e))?;
            let layout = read_archive_layout(&unpacked)?;
            assemble_manifest(&dir, &layout, &selected, &task_opts, &task_target)
        })
        .await
        .map_err(|e| CryptError::Other(format!("assembly task failed: {}", e)))??;

        tracing::info!(
            reference = %target,
            encrypted = manifest.blobs().filter(|b| b.is_encrypted()).count(),
            blobs = manifest.layers.len() + 1,
            "Manifest assembled"
        );

        for blob in manifest.blobs() {
            self.client.push_blob(target, blob).await?;
        }
        let digest = self.client.push_manifest(target, &manifest).await?;

        Ok(PushedImage {
            reference: target.clone(),
            digest,
            manifest,
        })
    }
}
