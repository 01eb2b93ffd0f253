//! Rebuild a loadable image from pulled blobs.
//!
//! Decrypts and decompresses every blob of a pulled manifest into the
//! `docker save` layout (`manifest.json`, config, one `layer.tar` per layer)
//! and packs it into a tar that `docker load` accepts.

use std::path::{Path, PathBuf};

use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};
use serde::Serialize;

use super::archive::{append_extension, create_tar, decompress};
use super::manifest::{BlobEntry, ImageManifest};
use crate::crypto::decrypt_file;
use crate::registry::ImageReference;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Decrypt `manifest`'s blobs into `out_dir` and pack them as `<out_dir>.tar`.
///
/// Every encrypted blob must have its data key unwrapped. Plain digests, when
/// known, are verified and a mismatching output file is removed.
pub fn decrypt_image(
    manifest: &ImageManifest,
    reference: &ImageReference,
    out_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).map_err(|e| CryptError::path(out_dir, e))?;

    let config_name = "config.json".to_string();
    let config_path = out_dir.join(&config_name);
    if manifest.config.is_encrypted() {
        restore_blob(&manifest.config, &config_path)?;
    } else {
        let src = manifest.config.local_file()?;
        std::fs::copy(src, &config_path).map_err(|e| CryptError::path(src, e))?;
    }

    let mut layer_names = Vec::with_capacity(manifest.layers.len());
    for (index, layer) in manifest.layers.iter().enumerate() {
        let name = format!("{:03}/layer.tar", index);
        let dir = out_dir.join(format!("{:03}", index));
        std::fs::create_dir_all(&dir).map_err(|e| CryptError::path(&dir, e))?;
        restore_blob(layer, &out_dir.join(&name))?;
        tracing::info!(index, digest = %layer.digest, "Restored layer");
        layer_names.push(name);
    }

    let index = vec![ArchiveManifestEntry {
        config: config_name,
        repo_tags: vec![format!(
            "{}/{}:{}",
            reference.registry,
            reference.repository,
            reference.tag_or_default()
        )],
        layers: layer_names,
    }];
    let index_path = out_dir.join("manifest.json");
    std::fs::write(&index_path, serde_json::to_vec(&index)?)
        .map_err(|e| CryptError::path(&index_path, e))?;

    let tar_path = append_extension(out_dir, "tar");
    create_tar(out_dir, &tar_path)?;
    tracing::info!(archive = %tar_path.display(), "Wrote image archive");
    Ok(tar_path)
}

/// Stored blob → (decrypt) → gunzip → `dest`, verifying the plain digest.
fn restore_blob(blob: &BlobEntry, dest: &Path) -> Result<()> {
    let src = blob.local_file()?;

    let decrypted;
    let compressed: &Path = if blob.is_encrypted() {
        let key = blob.data_key.as_ref().ok_or_else(|| {
            CryptError::ManifestError(format!("data key of {} was not unwrapped", blob.digest))
        })?;
        decrypted = append_extension(src, "dec");
        decrypt_file(src, &decrypted, key)?;
        &decrypted
    } else {
        src
    };

    let result = decompress(compressed, dest);
    if blob.is_encrypted() {
        std::fs::remove_file(compressed).map_err(|e| CryptError::path(compressed, e))?;
    }
    let (actual, _) = result?;

    if let Some(expected) = &blob.plain_digest {
        verify_plain(expected, &actual, dest)?;
    }
    Ok(())
}

fn verify_plain(expected: &Digest, actual: &Digest, file: &Path) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    let mismatch = CryptError::DigestMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    };
    let cleanup = std::fs::remove_file(file)
        .err()
        .map(|e| CryptError::path(file, e));
    Err(CryptError::with_cleanup(mismatch, [cleanup]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Algorithm, CryptoOpts};
    use crate::image::archive::extract_tar;
    use crate::image::assemble::{assemble_manifest, read_archive_layout};
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn build(temp: &Path, encrypt_all: bool) -> (ImageManifest, ImageReference, CryptoOpts) {
        fs::write(temp.join("cfg.json"), br#"{"os":"linux"}"#).unwrap();
        fs::create_dir_all(temp.join("a")).unwrap();
        fs::create_dir_all(temp.join("b")).unwrap();
        fs::write(temp.join("a/layer.tar"), vec![1u8; 70_000]).unwrap();
        fs::write(temp.join("b/layer.tar"), b"top secret").unwrap();
        let index = serde_json::json!([{
            "Config": "cfg.json",
            "RepoTags": null,
            "Layers": ["a/layer.tar", "b/layer.tar"],
        }]);
        fs::write(temp.join("manifest.json"), index.to_string()).unwrap();

        let layout = read_archive_layout(temp).unwrap();
        let selected: HashSet<String> = if encrypt_all {
            layout.layers.iter().map(|l| l.diff_id.clone()).collect()
        } else {
            [layout.layers[1].diff_id.clone()].into_iter().collect()
        };
        let reference = ImageReference::parse("localhost:5000/org/app:v1").unwrap();
        let opts = CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false).with_passphrase("pw");
        let mut manifest = assemble_manifest(temp, &layout, &selected, &opts, &reference).unwrap();
        manifest.open_keys(&opts, &reference).unwrap();
        (manifest, reference, opts)
    }

    #[test]
    fn test_decrypt_image_round_trip() {
        let temp = TempDir::new().unwrap();
        let (manifest, reference, _) = build(temp.path(), false);

        let out = temp.path().join("export");
        let tar = decrypt_image(&manifest, &reference, &out).unwrap();
        assert_eq!(tar, temp.path().join("export.tar"));

        assert_eq!(fs::read(out.join("config.json")).unwrap(), br#"{"os":"linux"}"#);
        assert_eq!(fs::read(out.join("000/layer.tar")).unwrap(), vec![1u8; 70_000]);
        assert_eq!(fs::read(out.join("001/layer.tar")).unwrap(), b"top secret");

        let unpacked = temp.path().join("unpacked");
        extract_tar(&tar, &unpacked).unwrap();
        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(unpacked.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(index[0]["RepoTags"][0], "localhost:5000/org/app:v1");
        assert_eq!(index[0]["Layers"][1], "001/layer.tar");
    }

    #[test]
    fn test_decrypt_image_requires_keys() {
        let temp = TempDir::new().unwrap();
        let (mut manifest, reference, _) = build(temp.path(), true);
        manifest.forget_keys();
        let err = decrypt_image(&manifest, &reference, &temp.path().join("export")).unwrap_err();
        assert!(matches!(err, CryptError::ManifestError(_)));
    }

    #[test]
    fn test_plain_digest_mismatch_removes_output() {
        let temp = TempDir::new().unwrap();
        let (mut manifest, reference, _) = build(temp.path(), true);
        manifest.layers[0].plain_digest = Some(Digest::from_bytes(b"something else"));

        let out = temp.path().join("export");
        let err = decrypt_image(&manifest, &reference, &out).unwrap_err();
        assert!(matches!(err, CryptError::DigestMismatch { .. }));
        assert!(!out.join("000/layer.tar").exists());
    }
}
