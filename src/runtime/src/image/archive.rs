//! Tar and gzip helpers for image archives and layer blobs.
//!
//! `docker save` produces a plain tar; layer blobs travel gzip-compressed.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use imgcrypt_core::digest::{Digest, DigestWriter};
use imgcrypt_core::error::{CryptError, Result};
use tar::{Archive, Builder};

/// Unpack a plain tar archive into `target_dir`, creating it if needed.
pub fn extract_tar(tar_path: &Path, target_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(target_dir).map_err(|e| CryptError::path(target_dir, e))?;

    let file = File::open(tar_path).map_err(|e| CryptError::path(tar_path, e))?;
    let mut archive = Archive::new(BufReader::new(file));
    archive.unpack(target_dir).map_err(|e| {
        CryptError::Other(format!(
            "Failed to extract {} to {}: {}",
            tar_path.display(),
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        archive = %tar_path.display(),
        target = %target_dir.display(),
        "Extracted archive"
    );
    Ok(())
}

/// Pack the contents of `source_dir` (not the directory itself) into a plain tar.
pub fn create_tar(source_dir: &Path, tar_path: &Path) -> Result<()> {
    let file = File::create(tar_path).map_err(|e| CryptError::path(tar_path, e))?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", source_dir)
        .map_err(|e| CryptError::path(source_dir, e))?;

    let mut writer = builder
        .into_inner()
        .map_err(|e| CryptError::path(tar_path, e))?;
    writer.flush().map_err(|e| CryptError::path(tar_path, e))?;

    tracing::debug!(
        source = %source_dir.display(),
        archive = %tar_path.display(),
        "Created archive"
    );
    Ok(())
}

/// Gzip `path` to `<path>.gz`.
///
/// Returns the new path with the digest and size of the compressed bytes.
pub fn compress(path: &Path) -> Result<(PathBuf, Digest, u64)> {
    let gz_path = append_extension(path, "gz");

    let mut src = File::open(path).map_err(|e| CryptError::path(path, e))?;
    let dst = File::create(&gz_path).map_err(|e| CryptError::path(&gz_path, e))?;

    let mut encoder = GzEncoder::new(DigestWriter::new(BufWriter::new(dst)), Compression::default());
    io::copy(&mut src, &mut encoder).map_err(|e| CryptError::path(path, e))?;
    let writer = encoder.finish().map_err(|e| CryptError::path(&gz_path, e))?;

    let (mut inner, digest, size) = writer.into_parts();
    inner.flush().map_err(|e| CryptError::path(&gz_path, e))?;

    tracing::debug!(file = %gz_path.display(), digest = %digest, size, "Compressed");
    Ok((gz_path, digest, size))
}

/// Gunzip `gz_path` into `out_path`.
///
/// Returns the digest and size of the uncompressed bytes.
pub fn decompress(gz_path: &Path, out_path: &Path) -> Result<(Digest, u64)> {
    let src = File::open(gz_path).map_err(|e| CryptError::path(gz_path, e))?;
    let dst = File::create(out_path).map_err(|e| CryptError::path(out_path, e))?;

    let mut decoder = GzDecoder::new(BufReader::new(src));
    let mut writer = DigestWriter::new(BufWriter::new(dst));
    io::copy(&mut decoder, &mut writer).map_err(|e| CryptError::path(gz_path, e))?;

    let (mut inner, digest, size) = writer.into_parts();
    inner.flush().map_err(|e| CryptError::path(out_path, e))?;
    Ok((digest, size))
}

/// `layer.tar` + `gz` → `layer.tar.gz`
pub(crate) fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_extract_tar() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("nested/b.txt"), b"beta").unwrap();

        let tar_path = temp.path().join("out.tar");
        create_tar(&src, &tar_path).unwrap();

        let dst = temp.path().join("dst");
        extract_tar(&tar_path, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("nested/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_extract_missing_archive() {
        let temp = TempDir::new().unwrap();
        let err = extract_tar(&temp.path().join("missing.tar"), &temp.path().join("x")).unwrap_err();
        assert!(err.to_string().contains("missing.tar"));
    }

    #[test]
    fn test_compress_digest_matches_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("layer.tar");
        fs::write(&path, vec![7u8; 100_000]).unwrap();

        let (gz, digest, size) = compress(&path).unwrap();
        assert_eq!(gz, temp.path().join("layer.tar.gz"));
        assert_eq!(size, fs::metadata(&gz).unwrap().len());
        assert_eq!(digest, Digest::from_file(&gz).unwrap());
        assert!(size < 100_000);
    }

    #[test]
    fn test_decompress_restores_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, br#"{"architecture":"amd64"}"#).unwrap();
        let plain = Digest::from_file(&path).unwrap();

        let (gz, _, _) = compress(&path).unwrap();
        let out = temp.path().join("restored.json");
        let (digest, size) = decompress(&gz, &out).unwrap();

        assert_eq!(digest, plain);
        assert_eq!(size, 24);
        assert_eq!(fs::read(&out).unwrap(), fs::read(&path).unwrap());
    }

    #[test]
    fn test_decompress_rejects_non_gzip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain");
        fs::write(&path, b"not gzip at all").unwrap();
        assert!(decompress(&path, &temp.path().join("out")).is_err());
    }
}
