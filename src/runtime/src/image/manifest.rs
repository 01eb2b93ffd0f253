//! Distribution manifest model.
//!
//! A Docker image manifest (schema 2) whose config and layer descriptors may
//! carry crypto metadata: the algorithm, the salt, and the wrapped data key of
//! an encrypted blob.

use std::path::{Path, PathBuf};

use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{unwrap_key, wrap_key, Algorithm, CryptoOpts, DataKey, WrappedKey};
use crate::registry::ImageReference;

/// Docker image manifest, schema 2.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Container config blob.
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Gzip-compressed layer tar.
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Salt for the config blob's data key.
///
/// Derived from the tag, so a reference that only pins a digest falls back to
/// `latest`. Pulls by digest can only open keys whose salt the manifest records.
pub fn config_salt(reference: &ImageReference) -> String {
    format!("{}:{}:config", reference.repository, reference.tag_or_default())
}

/// Salt for the data key of the layer at `index`.
pub fn layer_salt(reference: &ImageReference, index: usize) -> String {
    format!(
        "{}:{}:layer:{}",
        reference.repository,
        reference.tag_or_default(),
        index
    )
}

/// Crypto metadata of an encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobCrypto {
    pub algorithm: Algorithm,
    pub salt: String,
    /// Base64 of the wrapped data key
    pub wrapped_key: String,
    /// Digest of the uncompressed plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_digest: Option<Digest>,
}

/// A config or layer descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEntry {
    pub media_type: String,
    /// Digest of the bytes stored in the registry
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<BlobCrypto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Local file holding the stored bytes
    #[serde(skip)]
    pub filename: Option<PathBuf>,
    /// Uncompressed digest, known locally even when not published
    #[serde(skip)]
    pub plain_digest: Option<Digest>,
    /// Unwrapped data key, present only between unwrap and decryption
    #[serde(skip)]
    pub data_key: Option<DataKey>,
}

impl BlobEntry {
    pub fn new(media_type: &str, digest: Digest, size: u64, filename: PathBuf) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            crypto: None,
            urls: Vec::new(),
            filename: Some(filename),
            plain_digest: None,
            data_key: None,
        }
    }

    /// True if the stored bytes are ciphertext.
    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some() || self.compat_url().is_some()
    }

    fn compat_url(&self) -> Option<&str> {
        self.urls
            .iter()
            .map(String::as_str)
            .find(|u| WrappedKey::is_compat_url(u))
    }

    /// True when the manifest does not record the salt of this entry's key.
    fn needs_reference_salt(&self) -> bool {
        self.crypto.is_none() && self.compat_url().is_some()
    }

    /// Wrap `key` and record it on this entry.
    ///
    /// In legacy-compat mode the wrapped key goes into `urls` and the salt is
    /// not published; otherwise it is recorded in `crypto`.
    pub fn seal_key(&mut self, key: &DataKey, salt: String, opts: &CryptoOpts) -> Result<()> {
        let wrapped = wrap_key(key, &salt, opts)?;
        if opts.legacy_compat {
            self.urls.push(wrapped.to_compat_url());
        } else {
            self.crypto = Some(BlobCrypto {
                algorithm: wrapped.algorithm,
                salt,
                wrapped_key: wrapped.to_base64(),
                plain_digest: self.plain_digest.clone(),
            });
        }
        Ok(())
    }

    /// Recover the data key of an encrypted entry.
    ///
    /// `default_salt` is used when the manifest does not record one.
    pub fn open_key(&mut self, default_salt: &str, opts: &CryptoOpts) -> Result<()> {
        let (wrapped, salt) = if let Some(crypto) = &self.crypto {
            let wrapped = WrappedKey::from_base64(crypto.algorithm, &crypto.wrapped_key)?;
            (wrapped, crypto.salt.clone())
        } else if let Some(url) = self.compat_url() {
            (WrappedKey::from_compat_url(url)?, default_salt.to_string())
        } else {
            return Ok(());
        };

        self.data_key = Some(unwrap_key(&wrapped, &salt, opts)?);
        if let Some(crypto) = &self.crypto {
            self.plain_digest = crypto.plain_digest.clone();
        }
        Ok(())
    }

    /// The local file, or an error if the blob has not been staged.
    pub fn local_file(&self) -> Result<&Path> {
        self.filename.as_deref().ok_or_else(|| {
            CryptError::ManifestError(format!("blob {} has no local file", self.digest))
        })
    }
}

/// Docker image manifest with its staging directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: BlobEntry,
    pub layers: Vec<BlobEntry>,

    /// Directory holding the staged blobs
    #[serde(skip)]
    pub staging_dir: PathBuf,
}

impl ImageManifest {
    pub fn new(config: BlobEntry, layers: Vec<BlobEntry>, staging_dir: PathBuf) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config,
            layers,
            staging_dir,
        }
    }

    /// Parse a manifest fetched from a registry.
    pub fn from_json(data: &[u8], staging_dir: PathBuf) -> Result<Self> {
        let mut manifest: ImageManifest = serde_json::from_slice(data)
            .map_err(|e| CryptError::ManifestError(format!("Failed to parse manifest: {}", e)))?;
        if manifest.schema_version != 2 {
            return Err(CryptError::ManifestError(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        manifest.staging_dir = staging_dir;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Digest of the serialized manifest.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::from_bytes(&self.to_json()?))
    }

    /// Config followed by layers, in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobEntry> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    /// Unwrap the data key of every encrypted blob.
    ///
    /// Any failure aborts; keys unwrapped so far are dropped.
    pub fn open_keys(&mut self, opts: &CryptoOpts, reference: &ImageReference) -> Result<()> {
        let result = self.try_open_keys(opts, reference);
        if result.is_err() {
            self.forget_keys();
        }
        result
    }

    fn try_open_keys(&mut self, opts: &CryptoOpts, reference: &ImageReference) -> Result<()> {
        if reference.tag.is_none() && self.blobs().any(BlobEntry::needs_reference_salt) {
            return Err(CryptError::InvalidReference(format!(
                "{}: legacy key URLs derive their salt from the tag; pull by tag instead of digest",
                reference
            )));
        }
        self.config.open_key(&config_salt(reference), opts)?;
        for (index, layer) in self.layers.iter_mut().enumerate() {
            layer.open_key(&layer_salt(reference, index), opts)?;
        }
        Ok(())
    }

    /// Drop all unwrapped data keys.
    pub fn forget_keys(&mut self) {
        self.config.data_key = None;
        for layer in &mut self.layers {
            layer.data_key = None;
        }
    }

    /// Total stored size of config and layers.
    pub fn total_size(&self) -> u64 {
        self.blobs().map(|b| b.size).sum()
    }
}
