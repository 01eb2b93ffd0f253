//! imgcrypt Core - Foundational Types
//!
//! Error taxonomy, configuration, and content digests shared by the
//! imgcrypt runtime and CLI.

pub mod config;
pub mod digest;
pub mod error;

// Re-export commonly used types
pub use config::{CryptConfig, LogLevel, TransferConfig};
pub use digest::{Digest, DigestAlgorithm, DigestWriter, Digester, Verifier};
pub use error::{CompoundError, CryptError, Result};

/// imgcrypt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
