//! Blob cryptography.
//!
//! - [`keywrap`]: per-blob data keys wrapped under a passphrase-derived key
//! - [`stream`]: chunked AES-256-GCM encryption of blob files

pub mod keywrap;
pub mod stream;

pub use keywrap::{unwrap_key, wrap_key, Algorithm, CryptoOpts, DataKey, WrappedKey};
pub use stream::{decrypt_file, decrypt_stream, encrypt_file, encrypt_stream};
