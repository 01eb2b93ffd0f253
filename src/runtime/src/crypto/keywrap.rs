//! Data-key wrapping.
//!
//! Every encrypted blob gets its own random 32-byte data key. The data key is
//! never stored in the clear: it is wrapped under a key-encryption key (KEK)
//! derived from the user's passphrase and a per-blob salt.
//!
//! ## Key Derivation
//!
//! - KDF: PBKDF2-HMAC-SHA256, 40 000 iterations, 32-byte output
//! - Password: the passphrase
//! - Salt: the blob's context string (`<repository>:<tag>:<blob>`)
//!
//! ## Wrapping
//!
//! AES-256-GCM with a random 96-bit nonce, the salt as associated data.
//! Wrapped blob format: `iterations (u64 BE) || nonce (12 bytes) || ciphertext || tag (16 bytes)`
//!
//! ## Algorithms
//!
//! - `PBKDF2-AES256-GCM`: the scheme above
//! - `NONE`: the wrapped form is the raw key. Debug escape hatch only; it
//!   protects nothing.
//!
//! The legacy-compat representation packs the algorithm name and the wrapped
//! bytes into a URL (`?algos=<name>&key=<base64url>`) carried in a manifest
//! descriptor's `urls` list. The cryptography underneath is identical.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use imgcrypt_core::error::{CryptError, Result};
use reqwest::Url;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a data key in bytes.
pub const DATA_KEY_LEN: usize = 32;

/// PBKDF2 iteration count used for new wrapped keys.
pub const PBKDF2_ITERATIONS: u32 = 40_000;

/// Lowest iteration count accepted when unwrapping.
const MIN_PBKDF2_ITERATIONS: u64 = 10_000;

/// Highest iteration count accepted when unwrapping.
const MAX_PBKDF2_ITERATIONS: u64 = 10_000_000;

const ITERATIONS_LEN: usize = 8;

/// Host of the legacy key URL.
pub const COMPAT_KEY_URL: &str = "https://keys.imgcrypt.invalid/";

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Key-wrapping algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Key passed through unwrapped.
    #[serde(rename = "NONE")]
    None,

    /// PBKDF2-HMAC-SHA256 key derivation, AES-256-GCM key wrap.
    #[default]
    #[serde(rename = "PBKDF2-AES256-GCM")]
    Pbkdf2Aes256Gcm,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pbkdf2Aes256Gcm => "PBKDF2-AES256-GCM",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "PBKDF2-AES256-GCM" => Ok(Self::Pbkdf2Aes256Gcm),
            _ => Err(CryptError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// A 32-byte symmetric key protecting one blob.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; DATA_KEY_LEN]);

impl DataKey {
    /// Generate a fresh key from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; DATA_KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CryptError::KeyWrapError("Failed to generate data key".to_string()))?;
        Ok(Self(key))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; DATA_KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptError::KeyWrapError(format!(
                "data key must be {} bytes, got {}",
                DATA_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Options controlling how data keys are wrapped and unwrapped.
#[derive(Clone)]
pub struct CryptoOpts {
    pub algorithm: Algorithm,
    /// Carry wrapped keys as URLs in the descriptor's `urls` list.
    pub legacy_compat: bool,
    passphrase: String,
}

impl CryptoOpts {
    pub fn new(algorithm: Algorithm, legacy_compat: bool) -> Self {
        Self {
            algorithm,
            legacy_compat,
            passphrase: String::new(),
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.set_passphrase(passphrase);
        self
    }

    pub fn set_passphrase(&mut self, passphrase: impl Into<String>) {
        self.passphrase.zeroize();
        self.passphrase = passphrase.into();
    }

    fn passphrase(&self) -> Result<&str> {
        if self.passphrase.is_empty() {
            return Err(CryptError::ConfigError(format!(
                "a passphrase is required for {}",
                self.algorithm
            )));
        }
        Ok(&self.passphrase)
    }
}

impl fmt::Debug for CryptoOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoOpts")
            .field("algorithm", &self.algorithm)
            .field("legacy_compat", &self.legacy_compat)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl Drop for CryptoOpts {
    fn drop(&mut self) {
        self.passphrase.zeroize();
    }
}

/// An algorithm-tagged, protected data key.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub algorithm: Algorithm,
    bytes: Vec<u8>,
}

impl WrappedKey {
    pub fn new(algorithm: Algorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn from_base64(algorithm: Algorithm, encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptError::KeyWrapError(format!("invalid wrapped key encoding: {}", e)))?;
        Ok(Self { algorithm, bytes })
    }

    /// Legacy representation: the algorithm and key packed into a URL.
    pub fn to_compat_url(&self) -> String {
        let mut url = format!("{}?algos={}&key=", COMPAT_KEY_URL, self.algorithm);
        url.push_str(&URL_SAFE_NO_PAD.encode(&self.bytes));
        url
    }

    /// Parse the legacy URL representation.
    pub fn from_compat_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| CryptError::KeyWrapError(format!("invalid key URL: {}", e)))?;
        if parsed.scheme() != "https" {
            return Err(CryptError::KeyWrapError(format!(
                "key URL must use https: {}",
                url
            )));
        }

        let mut algorithm = None;
        let mut key = None;
        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "algos" => algorithm = Some(value.parse::<Algorithm>()?),
                "key" => key = Some(value.into_owned()),
                _ => {}
            }
        }

        let algorithm = algorithm
            .ok_or_else(|| CryptError::KeyWrapError("missing encryption algorithm".to_string()))?;
        let key = key.ok_or_else(|| CryptError::KeyWrapError("missing encryption key".to_string()))?;
        let trimmed = key.trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| URL_SAFE.decode(&key))
            .map_err(|e| CryptError::KeyWrapError(format!("invalid key encoding: {}", e)))?;

        Ok(Self { algorithm, bytes })
    }

    /// True if `url` looks like a legacy key URL.
    pub fn is_compat_url(url: &str) -> bool {
        url.starts_with(COMPAT_KEY_URL)
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ============================================================================
// Wrap / Unwrap operations
// ============================================================================

/// Wrap a data key under the algorithm chosen in `opts`.
///
/// `salt` is the blob's derivation context; unwrapping needs the same value.
pub fn wrap_key(key: &DataKey, salt: &str, opts: &CryptoOpts) -> Result<WrappedKey> {
    match opts.algorithm {
        Algorithm::None => Ok(WrappedKey::new(Algorithm::None, key.as_bytes().to_vec())),
        Algorithm::Pbkdf2Aes256Gcm => {
            let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
                .ok_or_else(|| CryptError::KeyWrapError("zero iteration count".to_string()))?;
            let kek = derive_kek(opts.passphrase()?, salt, iterations);

            let mut nonce_bytes = [0u8; NONCE_LEN];
            SystemRandom::new()
                .fill(&mut nonce_bytes)
                .map_err(|_| CryptError::KeyWrapError("Failed to generate nonce".to_string()))?;

            let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &kek)
                .map_err(|_| CryptError::KeyWrapError("Failed to create AES-256-GCM key".to_string()))?;
            let mut sealing_key = aead::SealingKey::new(unbound, SingleNonce::new(nonce_bytes));

            let mut in_out = key.as_bytes().to_vec();
            sealing_key
                .seal_in_place_append_tag(Aad::from(salt.as_bytes()), &mut in_out)
                .map_err(|_| CryptError::KeyWrapError("AES-256-GCM seal failed".to_string()))?;

            let mut bytes = Vec::with_capacity(ITERATIONS_LEN + NONCE_LEN + in_out.len());
            bytes.extend_from_slice(&u64::from(iterations.get()).to_be_bytes());
            bytes.extend_from_slice(&nonce_bytes);
            bytes.extend_from_slice(&in_out);
            in_out.zeroize();

            Ok(WrappedKey::new(Algorithm::Pbkdf2Aes256Gcm, bytes))
        }
    }
}

/// Recover a data key.
///
/// Fails with [`CryptError::AlgorithmMismatch`] when the key was wrapped under
/// a different algorithm than `opts` requests, and with an authentication
/// error when the passphrase or salt is wrong.
pub fn unwrap_key(wrapped: &WrappedKey, salt: &str, opts: &CryptoOpts) -> Result<DataKey> {
    if wrapped.algorithm != opts.algorithm {
        return Err(CryptError::AlgorithmMismatch);
    }

    match wrapped.algorithm {
        Algorithm::None => DataKey::from_slice(&wrapped.bytes),
        Algorithm::Pbkdf2Aes256Gcm => {
            let tag_len = aead::AES_256_GCM.tag_len();
            if wrapped.bytes.len() != ITERATIONS_LEN + NONCE_LEN + DATA_KEY_LEN + tag_len {
                return Err(CryptError::KeyWrapError(format!(
                    "wrapped key has unexpected length {}",
                    wrapped.bytes.len()
                )));
            }

            let (iter_bytes, rest) = wrapped.bytes.split_at(ITERATIONS_LEN);
            let (nonce_slice, sealed) = rest.split_at(NONCE_LEN);

            let iterations = u64::from_be_bytes(
                iter_bytes
                    .try_into()
                    .map_err(|_| CryptError::KeyWrapError("invalid iteration field".to_string()))?,
            );
            if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&iterations) {
                return Err(CryptError::KeyWrapError(format!(
                    "unsupported PBKDF2 iteration count {}",
                    iterations
                )));
            }
            let iterations = u32::try_from(iterations)
                .ok()
                .and_then(NonZeroU32::new)
                .ok_or_else(|| CryptError::KeyWrapError("invalid iteration count".to_string()))?;

            let nonce_bytes: [u8; NONCE_LEN] = nonce_slice
                .try_into()
                .map_err(|_| CryptError::KeyWrapError("invalid nonce".to_string()))?;

            let kek = derive_kek(opts.passphrase()?, salt, iterations);
            let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &kek)
                .map_err(|_| CryptError::KeyWrapError("Failed to create AES-256-GCM key".to_string()))?;
            let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce::new(nonce_bytes));

            let mut in_out = sealed.to_vec();
            let result = opening_key
                .open_in_place(Aad::from(salt.as_bytes()), &mut in_out)
                .map_err(|_| {
                    CryptError::AuthenticationError(
                        "could not unwrap data key: wrong passphrase or corrupted key".to_string(),
                    )
                })
                .and_then(|plain| DataKey::from_slice(plain));
            in_out.zeroize();
            result
        }
    }
}

/// Derive the 256-bit key-encryption key.
fn derive_kek(passphrase: &str, salt: &str, iterations: NonZeroU32) -> KeyBytes {
    let mut kek = KeyBytes([0u8; 32]);
    pbkdf2::derive(
        PBKDF2_ALG,
        iterations,
        salt.as_bytes(),
        passphrase.as_bytes(),
        &mut kek.0,
    );
    kek
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; 32]);

impl AsRef<[u8]> for KeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for KeyBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// A NonceSequence that yields a single nonce then fails.
struct SingleNonce {
    nonce: Option<[u8; NONCE_LEN]>,
}

impl SingleNonce {
    fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}
