//! Manifest assembly.
//!
//! Turns an unpacked `docker save` archive into staged registry blobs and the
//! manifest that references them. The config and every selected layer are
//! compressed, encrypted under a fresh data key, and carry the wrapped key;
//! other layers are compressed only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};
use serde::Deserialize;

use super::archive::{append_extension, compress};
use super::manifest::{
    config_salt, layer_salt, BlobEntry, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER,
};
use crate::crypto::{encrypt_file, CryptoOpts, DataKey};
use crate::registry::ImageReference;

/// Name of the index file inside a `docker save` archive.
const ARCHIVE_MANIFEST: &str = "manifest.json";

/// A layer tar inside an unpacked archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayer {
    pub path: PathBuf,
    /// Digest of the uncompressed tar
    pub diff_id: String,
}

/// Config and layer files of an unpacked `docker save` archive.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    pub config: PathBuf,
    /// Base-to-top order
    pub layers: Vec<ArchiveLayer>,
    pub repo_tags: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Read the layout of the archive unpacked at `dir`.
pub fn read_archive_layout(dir: &Path) -> Result<ArchiveLayout> {
    let index = dir.join(ARCHIVE_MANIFEST);
    let data = std::fs::read(&index).map_err(|e| CryptError::path(&index, e))?;
    let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(&data).map_err(|e| {
        CryptError::ManifestError(format!("Failed to parse {}: {}", index.display(), e))
    })?;

    let entry = entries.into_iter().next().ok_or_else(|| {
        CryptError::ManifestError(format!("{} lists no images", index.display()))
    })?;

    let layers = entry
        .layers
        .iter()
        .map(|rel| -> Result<ArchiveLayer> {
            let path = dir.join(rel);
            let diff_id = Digest::from_file(&path)?.to_string();
            Ok(ArchiveLayer { path, diff_id })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ArchiveLayout {
        config: dir.join(entry.config),
        layers,
        repo_tags: entry.repo_tags.unwrap_or_default(),
    })
}

/// Build the manifest for `layout`, staging every blob next to its source file.
///
/// `layers_to_encrypt` holds diff IDs. Layer order is preserved. Any failure
/// aborts without a partial manifest.
pub fn assemble_manifest(
    staging_dir: &Path,
    layout: &ArchiveLayout,
    layers_to_encrypt: &HashSet<String>,
    opts: &CryptoOpts,
    reference: &ImageReference,
) -> Result<ImageManifest> {
    let config = stage_encrypted(
        &layout.config,
        MEDIA_TYPE_CONFIG,
        config_salt(reference),
        opts,
    )?;
    tracing::info!(digest = %config.digest, size = config.size, "Encrypted config");

    let mut layers = Vec::with_capacity(layout.layers.len());
    for (index, layer) in layout.layers.iter().enumerate() {
        let entry = if layers_to_encrypt.contains(&layer.diff_id) {
            let entry = stage_encrypted(
                &layer.path,
                MEDIA_TYPE_LAYER,
                layer_salt(reference, index),
                opts,
            )?;
            tracing::info!(
                index,
                diff_id = %layer.diff_id,
                digest = %entry.digest,
                "Encrypted layer"
            );
            entry
        } else {
            let (gz, digest, size) = compress(&layer.path)?;
            tracing::info!(index, diff_id = %layer.diff_id, digest = %digest, "Compressed layer");
            let mut entry = BlobEntry::new(MEDIA_TYPE_LAYER, digest, size, gz);
            entry.plain_digest = Some(layer.diff_id.parse()?);
            entry
        };
        layers.push(entry);
    }

    Ok(ImageManifest::new(
        config,
        layers,
        staging_dir.to_path_buf(),
    ))
}

/// `file` → `file.gz` → `file.gz.aes`, with the data key sealed under `salt`.
fn stage_encrypted(
    file: &Path,
    media_type: &str,
    salt: String,
    opts: &CryptoOpts,
) -> Result<BlobEntry> {
    let plain_digest = Digest::from_file(file)?;
    let (gz, _, _) = compress(file)?;

    let key = DataKey::generate()?;
    let encrypted = append_extension(&gz, "aes");
    let (digest, size) = encrypt_file(&gz, &encrypted, &key)?;
    std::fs::remove_file(&gz).map_err(|e| CryptError::path(&gz, e))?;

    let mut entry = BlobEntry::new(media_type, digest, size, encrypted);
    entry.plain_digest = Some(plain_digest);
    entry.seal_key(&key, salt, opts)?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt_file, unwrap_key, Algorithm, WrappedKey};
    use std::fs;
    use tempfile::TempDir;

    fn write_archive(dir: &Path, layers: &[&[u8]]) -> Vec<String> {
        fs::write(dir.join("cfg.json"), br#"{"architecture":"amd64"}"#).unwrap();
        let mut names = Vec::new();
        for (i, content) in layers.iter().enumerate() {
            let name = format!("l{}/layer.tar", i);
            fs::create_dir_all(dir.join(format!("l{}", i))).unwrap();
            fs::write(dir.join(&name), content).unwrap();
            names.push(name);
        }
        let index = serde_json::json!([{
            "Config": "cfg.json",
            "RepoTags": ["org/app:v1"],
            "Layers": names,
        }]);
        fs::write(dir.join("manifest.json"), index.to_string()).unwrap();
        names
    }

    fn opts() -> CryptoOpts {
        CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false).with_passphrase("correct horse")
    }

    #[test]
    fn test_read_archive_layout() {
        let temp = TempDir::new().unwrap();
        write_archive(temp.path(), &[b"base", b"app"]);

        let layout = read_archive_layout(temp.path()).unwrap();
        assert_eq!(layout.config, temp.path().join("cfg.json"));
        assert_eq!(layout.layers.len(), 2);
        assert_eq!(layout.layers[1].diff_id, Digest::from_bytes(b"app").to_string());
        assert_eq!(layout.repo_tags, vec!["org/app:v1".to_string()]);
    }

    #[test]
    fn test_read_archive_layout_missing_index() {
        let temp = TempDir::new().unwrap();
        assert!(read_archive_layout(temp.path()).is_err());
    }

    #[test]
    fn test_assemble_encrypts_selected_layers_only() {
        let temp = TempDir::new().unwrap();
        write_archive(temp.path(), &[b"base layer", b"secret layer"]);
        let layout = read_archive_layout(temp.path()).unwrap();
        let reference = ImageReference::parse("org/app:v1").unwrap();

        let selected: HashSet<String> = [layout.layers[1].diff_id.clone()].into_iter().collect();
        let manifest =
            assemble_manifest(temp.path(), &layout, &selected, &opts(), &reference).unwrap();

        assert!(manifest.config.is_encrypted());
        assert!(!manifest.layers[0].is_encrypted());
        assert!(manifest.layers[1].is_encrypted());
        assert_eq!(
            manifest.layers[1].crypto.as_ref().unwrap().salt,
            "org/app:v1:layer:1"
        );

        // Stored digests describe the staged files.
        for blob in manifest.blobs() {
            let file = blob.local_file().unwrap();
            assert_eq!(Digest::from_file(file).unwrap(), blob.digest);
            assert_eq!(fs::metadata(file).unwrap().len(), blob.size);
        }
        assert!(manifest.layers[0]
            .local_file()
            .unwrap()
            .to_string_lossy()
            .ends_with("layer.tar.gz"));
        assert!(!temp.path().join("l1/layer.tar.gz").exists());
    }

    #[test]
    fn test_assembled_layer_decrypts() {
        let temp = TempDir::new().unwrap();
        write_archive(temp.path(), &[b"secret layer"]);
        let layout = read_archive_layout(temp.path()).unwrap();
        let reference = ImageReference::parse("org/app:v1").unwrap();
        let selected: HashSet<String> = [layout.layers[0].diff_id.clone()].into_iter().collect();
        let manifest =
            assemble_manifest(temp.path(), &layout, &selected, &opts(), &reference).unwrap();

        let crypto = manifest.layers[0].crypto.as_ref().unwrap();
        let wrapped = WrappedKey::from_base64(crypto.algorithm, &crypto.wrapped_key).unwrap();
        let key = unwrap_key(&wrapped, &crypto.salt, &opts()).unwrap();

        let out = temp.path().join("out.gz");
        decrypt_file(manifest.layers[0].local_file().unwrap(), &out, &key).unwrap();
        let (plain, _) = crate::image::archive::decompress(&out, &temp.path().join("out.tar")).unwrap();
        assert_eq!(Some(plain), crypto.plain_digest);
    }

    #[test]
    fn test_assemble_fails_without_passphrase() {
        let temp = TempDir::new().unwrap();
        write_archive(temp.path(), &[b"layer"]);
        let layout = read_archive_layout(temp.path()).unwrap();
        let reference = ImageReference::parse("org/app:v1").unwrap();
        let no_pass = CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false);
        assert!(assemble_manifest(temp.path(), &layout, &HashSet::new(), &no_pass, &reference).is_err());
    }
}
