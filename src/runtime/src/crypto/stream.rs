//! Streaming authenticated encryption of blobs.
//!
//! Blobs are encrypted as a sequence of independently authenticated packages
//! so arbitrarily large layers never have to fit in memory.
//!
//! ## Package format (version 0x20)
//!
//! ```text
//! ┌─────────┬───────┬─────────────┬──────────────┬──────────────┬──────────┐
//! │ version │ suite │ len (u16LE) │ nonce (12 B) │ ciphertext   │ tag (16) │
//! └─────────┴───────┴─────────────┴──────────────┴──────────────┴──────────┘
//!   header: 16 bytes                               len bytes
//! ```
//!
//! - Every package but the last carries exactly [`MAX_PAYLOAD`] bytes.
//! - The header nonce is the stream's random base nonce; the top bit of its
//!   first byte marks the final package.
//! - The AEAD nonce of package `i` is the header nonce with `i` (u32 LE)
//!   XORed into its last four bytes, so packages cannot be reordered,
//!   dropped, or replayed across streams.
//! - Associated data is the first four header bytes.
//!
//! An empty plaintext still produces one (empty) final package, so a
//! truncated stream is always detected.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use imgcrypt_core::digest::{Digest, DigestWriter};
use imgcrypt_core::error::{CryptError, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use super::keywrap::DataKey;

/// Stream format version.
pub const STREAM_VERSION: u8 = 0x20;

/// Cipher suite identifier for AES-256-GCM.
pub const SUITE_AES_256_GCM: u8 = 0x00;

/// Package header length.
pub const HEADER_LEN: usize = 16;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// Plaintext bytes per package.
pub const MAX_PAYLOAD: usize = 32 * 1024;

const FINAL_FLAG: u8 = 0x80;
const AAD_LEN: usize = 4;

/// Encrypt everything `src` yields into `dst`.
///
/// Returns the digest of the ciphertext written and its length. The digest is
/// computed in the same pass; the ciphertext is never read back.
pub fn encrypt_stream<R: Read, W: Write>(
    mut src: R,
    dst: W,
    key: &DataKey,
) -> Result<(Digest, u64)> {
    let cipher = stream_key(key)?;

    let mut base_nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut base_nonce)
        .map_err(|_| CryptError::CipherError("Failed to generate stream nonce".to_string()))?;
    base_nonce[0] &= !FINAL_FLAG;

    let mut out = DigestWriter::new(dst);
    let mut current = vec![0u8; MAX_PAYLOAD];
    let mut next = vec![0u8; MAX_PAYLOAD];
    let mut current_len = read_full(&mut src, &mut current)?;
    let mut seq: u32 = 0;

    loop {
        // A full package may still be the last one; look ahead to find out.
        let next_len = if current_len == MAX_PAYLOAD {
            read_full(&mut src, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        seal_package(&cipher, &base_nonce, seq, last, &mut current[..current_len], &mut out)?;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        seq = seq
            .checked_add(1)
            .ok_or_else(|| CryptError::CipherError("stream exceeds package limit".to_string()))?;
    }

    out.flush()?;
    let (_, digest, written) = out.into_parts();
    Ok((digest, written))
}

/// Decrypt and authenticate a package stream from `src` into `dst`.
///
/// Aborts at the first package that fails authentication. Plaintext of earlier
/// packages may already have reached `dst`; callers writing to a file must
/// discard it on error (see [`decrypt_file`]).
pub fn decrypt_stream<R: Read, W: Write>(mut src: R, mut dst: W, key: &DataKey) -> Result<u64> {
    let cipher = stream_key(key)?;

    let mut header = [0u8; HEADER_LEN];
    let mut body = vec![0u8; MAX_PAYLOAD + TAG_LEN];
    let mut base_nonce: Option<[u8; NONCE_LEN]> = None;
    let mut seq: u32 = 0;
    let mut written: u64 = 0;

    loop {
        let n = read_full(&mut src, &mut header)?;
        if n == 0 {
            return Err(CryptError::CipherError(
                "stream ended before the final package".to_string(),
            ));
        }
        if n < HEADER_LEN {
            return Err(CryptError::CipherError(format!(
                "truncated header in package {}",
                seq
            )));
        }
        if header[0] != STREAM_VERSION {
            return Err(CryptError::CipherError(format!(
                "unsupported stream version {:#04x}",
                header[0]
            )));
        }
        if header[1] != SUITE_AES_256_GCM {
            return Err(CryptError::CipherError(format!(
                "unsupported cipher suite {:#04x}",
                header[1]
            )));
        }

        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(CryptError::CipherError(format!(
                "package {} declares {} bytes, limit is {}",
                seq, len, MAX_PAYLOAD
            )));
        }

        let mut header_nonce = [0u8; NONCE_LEN];
        header_nonce.copy_from_slice(&header[AAD_LEN..]);
        let last = header_nonce[0] & FINAL_FLAG != 0;
        let mut masked = header_nonce;
        masked[0] &= !FINAL_FLAG;
        match base_nonce {
            None => base_nonce = Some(masked),
            Some(base) if base != masked => {
                return Err(CryptError::AuthenticationError(format!(
                    "package {} does not belong to this stream",
                    seq
                )));
            }
            Some(_) => {}
        }

        let sealed = &mut body[..len + TAG_LEN];
        if read_full(&mut src, sealed)? < len + TAG_LEN {
            return Err(CryptError::CipherError(format!(
                "truncated body in package {}",
                seq
            )));
        }

        let nonce = package_nonce(&header_nonce, seq);
        let plain = cipher
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(&header[..AAD_LEN]),
                sealed,
            )
            .map_err(|_| {
                CryptError::AuthenticationError(format!("package {} failed authentication", seq))
            })?;
        dst.write_all(plain)?;
        written += plain.len() as u64;

        if last {
            let mut probe = [0u8; 1];
            if read_full(&mut src, &mut probe)? != 0 {
                return Err(CryptError::CipherError(
                    "unexpected data after the final package".to_string(),
                ));
            }
            break;
        }
        if len != MAX_PAYLOAD {
            return Err(CryptError::CipherError(format!(
                "short package {} is not marked final",
                seq
            )));
        }
        seq = seq
            .checked_add(1)
            .ok_or_else(|| CryptError::CipherError("stream exceeds package limit".to_string()))?;
    }

    dst.flush()?;
    Ok(written)
}

/// Encrypt the file `src` into `dst`.
///
/// Returns the ciphertext digest and size. On failure `dst` is closed and
/// removed; close or removal failures are reported alongside the cipher error.
pub fn encrypt_file(src: &Path, dst: &Path, key: &DataKey) -> Result<(Digest, u64)> {
    let input = File::open(src).map_err(|e| CryptError::path(src, e))?;
    let output = File::create(dst).map_err(|e| CryptError::path(dst, e))?;
    let mut writer = BufWriter::new(output);

    let result = encrypt_stream(BufReader::new(input), &mut writer, key);
    finish(writer, dst, result)
}

/// Decrypt and authenticate the file `src` into `dst`.
///
/// `dst` exists afterwards only if every package authenticated.
pub fn decrypt_file(src: &Path, dst: &Path, key: &DataKey) -> Result<u64> {
    let input = File::open(src).map_err(|e| CryptError::path(src, e))?;
    let output = File::create(dst).map_err(|e| CryptError::path(dst, e))?;
    let mut writer = BufWriter::new(output);

    let result = decrypt_stream(BufReader::new(input), &mut writer, key);
    finish(writer, dst, result)
}

/// Close `writer` and keep the file on success, otherwise close and remove it.
fn finish<T>(writer: BufWriter<File>, path: &Path, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => match close(writer, path) {
            Ok(()) => Ok(value),
            Err(close_err) => {
                let remove_err = remove_unauthenticated(path);
                Err(CryptError::with_cleanup(close_err, [remove_err]))
            }
        },
        Err(err) => {
            let close_err = close(writer, path).err();
            let remove_err = remove_unauthenticated(path);
            tracing::debug!(path = %path.display(), error = %err, "Discarded cipher output");
            Err(CryptError::with_cleanup(err, [close_err, remove_err]))
        }
    }
}

fn close(writer: BufWriter<File>, path: &Path) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| CryptError::path(path, e.into_error()))?;
    file.sync_all().map_err(|e| CryptError::path(path, e))
}

fn remove_unauthenticated(path: &Path) -> Option<CryptError> {
    std::fs::remove_file(path).err().map(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Unauthenticated file could not be removed");
        CryptError::Other(format!(
            "warning, unauthenticated file could not be removed: {}: {}",
            path.display(),
            e
        ))
    })
}

fn seal_package<W: Write>(
    cipher: &LessSafeKey,
    base_nonce: &[u8; NONCE_LEN],
    seq: u32,
    last: bool,
    payload: &mut [u8],
    out: &mut W,
) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = STREAM_VERSION;
    header[1] = SUITE_AES_256_GCM;
    header[2..AAD_LEN].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    header[AAD_LEN..].copy_from_slice(base_nonce);
    if last {
        header[AAD_LEN] |= FINAL_FLAG;
    }

    let mut header_nonce = [0u8; NONCE_LEN];
    header_nonce.copy_from_slice(&header[AAD_LEN..]);
    let nonce = package_nonce(&header_nonce, seq);

    let tag = cipher
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&header[..AAD_LEN]),
            payload,
        )
        .map_err(|_| CryptError::CipherError(format!("failed to seal package {}", seq)))?;

    out.write_all(&header)?;
    out.write_all(payload)?;
    out.write_all(tag.as_ref())?;
    Ok(())
}

fn package_nonce(header_nonce: &[u8; NONCE_LEN], seq: u32) -> [u8; NONCE_LEN] {
    let mut nonce = *header_nonce;
    for (n, s) in nonce[NONCE_LEN - 4..].iter_mut().zip(seq.to_le_bytes()) {
        *n ^= s;
    }
    nonce
}

fn stream_key(key: &DataKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&aead::AES_256_GCM, key.as_bytes())
        .map_err(|_| CryptError::CipherError("Failed to create AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roundtrip(plaintext: &[u8]) -> Vec<u8> {
        let key = DataKey::generate().unwrap();
        let mut ciphertext = Vec::new();
        let (digest, size) = encrypt_stream(plaintext, &mut ciphertext, &key).unwrap();
        assert_eq!(size, ciphertext.len() as u64);
        assert_eq!(digest, Digest::from_bytes(&ciphertext));

        let mut recovered = Vec::new();
        let n = decrypt_stream(&ciphertext[..], &mut recovered, &key).unwrap();
        assert_eq!(n, plaintext.len() as u64);
        recovered
    }

    fn package_count(len: usize) -> usize {
        std::cmp::max(1, (len + MAX_PAYLOAD - 1) / MAX_PAYLOAD)
    }

    #[test]
    fn test_roundtrip_sizes() {
        for len in [
            0,
            1,
            MAX_PAYLOAD - 1,
            MAX_PAYLOAD,
            MAX_PAYLOAD + 1,
            3 * MAX_PAYLOAD,
            3 * MAX_PAYLOAD + 17,
        ] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&plaintext), plaintext, "len = {}", len);
        }
    }

    #[test]
    fn test_ciphertext_size() {
        for len in [0, 10, MAX_PAYLOAD, 2 * MAX_PAYLOAD + 5] {
            let key = DataKey::generate().unwrap();
            let mut out = Vec::new();
            let (_, size) = encrypt_stream(&vec![0u8; len][..], &mut out, &key).unwrap();
            let expected = len + package_count(len) * (HEADER_LEN + TAG_LEN);
            assert_eq!(size as usize, expected, "len = {}", len);
        }
    }

    #[test]
    fn test_empty_input_is_one_final_package() {
        let key = DataKey::generate().unwrap();
        let mut out = Vec::new();
        encrypt_stream(&b""[..], &mut out, &key).unwrap();
        assert_eq!(out.len(), HEADER_LEN + TAG_LEN);
        assert_eq!(out[0], STREAM_VERSION);
        assert_ne!(out[AAD_LEN] & FINAL_FLAG, 0);
    }

    #[test]
    fn test_empty_ciphertext_rejected() {
        let key = DataKey::generate().unwrap();
        let err = decrypt_stream(&b""[..], Vec::new(), &key).unwrap_err();
        assert!(matches!(err, CryptError::CipherError(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = DataKey::generate().unwrap();
        let other = DataKey::generate().unwrap();
        let mut out = Vec::new();
        encrypt_stream(&b"secret layer"[..], &mut out, &key).unwrap();
        let err = decrypt_stream(&out[..], Vec::new(), &other).unwrap_err();
        assert!(matches!(err, CryptError::AuthenticationError(_)));
    }

    #[test]
    fn test_every_flipped_byte_is_detected() {
        let key = DataKey::generate().unwrap();
        let plaintext = vec![0x5Au8; MAX_PAYLOAD + 100];
        let mut ciphertext = Vec::new();
        encrypt_stream(&plaintext[..], &mut ciphertext, &key).unwrap();

        // Header bytes of both packages plus a sample of body and tag bytes.
        let second = HEADER_LEN + MAX_PAYLOAD + TAG_LEN;
        let mut positions: Vec<usize> = (0..HEADER_LEN).collect();
        positions.extend(second..second + HEADER_LEN);
        positions.extend((HEADER_LEN..ciphertext.len()).step_by(997));
        positions.push(ciphertext.len() - 1);

        for pos in positions {
            let mut tampered = ciphertext.clone();
            tampered[pos] ^= 0x01;
            assert!(
                decrypt_stream(&tampered[..], Vec::new(), &key).is_err(),
                "flip at {} went unnoticed",
                pos
            );
        }
    }

    #[test]
    fn test_truncation_detected() {
        let key = DataKey::generate().unwrap();
        let mut ciphertext = Vec::new();
        encrypt_stream(&vec![1u8; 2 * MAX_PAYLOAD + 1][..], &mut ciphertext, &key).unwrap();

        // Drop the final package entirely.
        let cut = 2 * (HEADER_LEN + MAX_PAYLOAD + TAG_LEN);
        assert!(decrypt_stream(&ciphertext[..cut], Vec::new(), &key).is_err());
        // Cut inside a package.
        assert!(decrypt_stream(&ciphertext[..cut - 3], Vec::new(), &key).is_err());
    }

    #[test]
    fn test_reordered_packages_detected() {
        let key = DataKey::generate().unwrap();
        let mut ciphertext = Vec::new();
        encrypt_stream(&vec![9u8; 3 * MAX_PAYLOAD][..], &mut ciphertext, &key).unwrap();

        let pkg = HEADER_LEN + MAX_PAYLOAD + TAG_LEN;
        let mut swapped = Vec::new();
        swapped.extend_from_slice(&ciphertext[pkg..2 * pkg]);
        swapped.extend_from_slice(&ciphertext[..pkg]);
        swapped.extend_from_slice(&ciphertext[2 * pkg..]);
        let err = decrypt_stream(&swapped[..], Vec::new(), &key).unwrap_err();
        assert!(matches!(err, CryptError::AuthenticationError(_)));
    }

    #[test]
    fn test_trailing_data_detected() {
        let key = DataKey::generate().unwrap();
        let mut ciphertext = Vec::new();
        encrypt_stream(&b"abc"[..], &mut ciphertext, &key).unwrap();
        ciphertext.push(0);
        assert!(decrypt_stream(&ciphertext[..], Vec::new(), &key).is_err());
    }

    #[test]
    fn test_spliced_stream_detected() {
        let key = DataKey::generate().unwrap();
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_stream(&vec![1u8; MAX_PAYLOAD + 1][..], &mut a, &key).unwrap();
        encrypt_stream(&vec![1u8; MAX_PAYLOAD + 1][..], &mut b, &key).unwrap();

        let pkg = HEADER_LEN + MAX_PAYLOAD + TAG_LEN;
        let mut spliced = a[..pkg].to_vec();
        spliced.extend_from_slice(&b[pkg..]);
        assert!(decrypt_stream(&spliced[..], Vec::new(), &key).is_err());
    }

    #[test]
    fn test_file_roundtrip_and_digest() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("layer.tar.gz");
        let enc = tmp.path().join("layer.tar.gz.aes");
        let dec = tmp.path().join("layer.out");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7) as u8).collect();
        std::fs::write(&plain, &data).unwrap();

        let key = DataKey::generate().unwrap();
        let (digest, size) = encrypt_file(&plain, &enc, &key).unwrap();
        assert_eq!(digest, Digest::from_file(&enc).unwrap());
        assert_eq!(size, std::fs::metadata(&enc).unwrap().len());

        decrypt_file(&enc, &dec, &key).unwrap();
        assert_eq!(std::fs::read(&dec).unwrap(), data);
    }

    #[test]
    fn test_failed_decrypt_leaves_no_file() {
        let tmp = TempDir::new().unwrap();
        let plain = tmp.path().join("in");
        let enc = tmp.path().join("in.aes");
        let dec = tmp.path().join("out");
        std::fs::write(&plain, vec![3u8; 3 * MAX_PAYLOAD]).unwrap();

        let key = DataKey::generate().unwrap();
        encrypt_file(&plain, &enc, &key).unwrap();

        // Corrupt the last package so earlier plaintext has been written already.
        let mut bytes = std::fs::read(&enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&enc, &bytes).unwrap();

        let err = decrypt_file(&enc, &dec, &key).unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(!err.is_cleanup_failure());
        assert!(!dec.exists());
    }

    #[test]
    fn test_missing_source_reports_path() {
        let tmp = TempDir::new().unwrap();
        let key = DataKey::generate().unwrap();
        let err = encrypt_file(&tmp.path().join("missing"), &tmp.path().join("out"), &key)
            .unwrap_err();
        assert!(matches!(err, CryptError::PathError { .. }));
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_package_nonce_varies_with_sequence() {
        let base = [0u8; NONCE_LEN];
        assert_ne!(package_nonce(&base, 0), package_nonce(&base, 1));
        assert_eq!(package_nonce(&base, 0), base);
    }
}
