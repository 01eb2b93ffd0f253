//! `imgcrypt decrypt` command - Decrypt a single blob with its wrapped key.

use std::path::{Path, PathBuf};

use clap::Args;
use imgcrypt_core::{CryptError, Result};
use imgcrypt_runtime::{decrypt_file, unwrap_key, Algorithm, DataKey, WrappedKey};

use super::CryptoArgs;

#[derive(Args)]
pub struct DecryptArgs {
    /// Encrypted blob file
    pub input: PathBuf,

    /// Where to write the plaintext
    #[arg(short, long)]
    pub output: PathBuf,

    /// Wrapped data key: base64 from the manifest, or a legacy key URL
    #[arg(long)]
    pub key: String,

    /// Algorithm the manifest records for a base64 key (key URLs carry their own)
    #[arg(long, default_value = "PBKDF2-AES256-GCM")]
    pub key_algorithm: Algorithm,

    /// Salt the key was wrapped with (e.g., "org/app:v1:layer:0")
    #[arg(long)]
    pub salt: String,

    /// Gunzip the decrypted blob
    #[arg(long)]
    pub decompress: bool,

    #[command(flatten)]
    pub crypto: CryptoArgs,
}

pub async fn execute(args: DecryptArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opts = args.crypto.to_opts()?;
    let wrapped = if WrappedKey::is_compat_url(&args.key) {
        WrappedKey::from_compat_url(&args.key)?
    } else {
        WrappedKey::from_base64(args.key_algorithm, &args.key)?
    };
    let key = unwrap_key(&wrapped, &args.salt, &opts)?;

    let DecryptArgs {
        input,
        output,
        decompress,
        ..
    } = args;
    let written =
        tokio::task::spawn_blocking(move || decrypt_blob(&input, &output, &key, decompress))
            .await??;

    println!("Decrypted {} bytes", written);
    Ok(())
}

/// Decrypt `input` into `output`, gunzipping on the way when `decompress` is set.
///
/// `output` is only left behind on success.
fn decrypt_blob(input: &Path, output: &Path, key: &DataKey, decompress: bool) -> Result<u64> {
    if !decompress {
        return decrypt_file(input, output, key);
    }

    let staged = input.with_extension("gz.dec");
    decrypt_file(input, &staged, key)?;
    let result = imgcrypt_runtime::image::decompress(&staged, output).map(|(_, size)| size);
    let staged_err = std::fs::remove_file(&staged)
        .map_err(|e| CryptError::path(&staged, e))
        .err();

    match (result, staged_err) {
        (Ok(size), None) => Ok(size),
        (Ok(_), Some(e)) => Err(e),
        (Err(e), staged_err) => {
            let output_err = match std::fs::remove_file(output) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                    Some(CryptError::path(output, err))
                }
                _ => None,
            };
            Err(CryptError::with_cleanup(e, [staged_err, output_err]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgcrypt_runtime::image::compress;
    use imgcrypt_runtime::{encrypt_file, wrap_key, CryptoOpts};
    use tempfile::TempDir;

    const SALT: &str = "org/app:v1:layer:0";

    fn crypto(algorithm: Algorithm) -> CryptoArgs {
        CryptoArgs {
            algorithm,
            compat: false,
            passphrase: Some("pw".to_string()),
        }
    }

    /// Encrypt `plain` into `dir/blob.aes`; return the blob and its base64 wrapped key.
    fn stage_blob(dir: &Path, plain: &Path) -> (PathBuf, String) {
        let key = DataKey::generate().unwrap();
        let blob = dir.join("blob.aes");
        encrypt_file(plain, &blob, &key).unwrap();
        let opts = CryptoOpts::new(Algorithm::Pbkdf2Aes256Gcm, false).with_passphrase("pw");
        let wrapped = wrap_key(&key, SALT, &opts).unwrap();
        (blob, wrapped.to_base64())
    }

    fn args(input: PathBuf, output: PathBuf, key: String, decompress: bool) -> DecryptArgs {
        DecryptArgs {
            input,
            output,
            key,
            key_algorithm: Algorithm::Pbkdf2Aes256Gcm,
            salt: SALT.to_string(),
            decompress,
            crypto: crypto(Algorithm::Pbkdf2Aes256Gcm),
        }
    }

    #[tokio::test]
    async fn test_decrypt_and_decompress() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("layer.tar");
        std::fs::write(&plain, vec![9u8; 50_000]).unwrap();
        let (gz, _, _) = compress(&plain).unwrap();
        let (blob, key) = stage_blob(temp.path(), &gz);

        let output = temp.path().join("out.tar");
        execute(args(blob, output.clone(), key, true)).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), vec![9u8; 50_000]);
        assert!(!temp.path().join("blob.gz.dec").exists());
    }

    #[tokio::test]
    async fn test_algorithm_mismatch_is_reported() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("config.json");
        std::fs::write(&plain, b"{}").unwrap();
        let (blob, key) = stage_blob(temp.path(), &plain);

        let output = temp.path().join("out.json");
        let mut decrypt = args(blob, output.clone(), key, false);
        decrypt.crypto = crypto(Algorithm::None);

        let err = execute(decrypt).await.unwrap_err();
        assert_eq!(err.to_string(), "encryption type does not match decryption type");
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_failed_gunzip_removes_output() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("not-gzip.bin");
        std::fs::write(&plain, vec![0x42u8; 4096]).unwrap();
        let (blob, key) = stage_blob(temp.path(), &plain);

        let output = temp.path().join("out.tar");
        assert!(execute(args(blob, output.clone(), key, true)).await.is_err());
        assert!(!output.exists());
        assert!(!temp.path().join("blob.gz.dec").exists());
    }
}
