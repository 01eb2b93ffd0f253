use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// imgcrypt error types
#[derive(Error, Debug)]
pub enum CryptError {
    /// The algorithm recorded on a wrapped key differs from the one requested
    #[error("encryption type does not match decryption type")]
    AlgorithmMismatch,

    /// Unknown key-wrapping algorithm name
    #[error("Unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Key wrapping or unwrapping failed for a reason other than authentication
    #[error("Key wrap error: {0}")]
    KeyWrapError(String),

    /// An authentication tag did not verify (wrong key, passphrase, salt, or tampered data)
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// Streaming cipher failure (malformed stream, truncation, bad header)
    #[error("Cipher error: {0}")]
    CipherError(String),

    /// Downloaded or decrypted content does not match its expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A digest string could not be parsed
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// The image history has no marker instruction
    #[error("Image was not built with the required label: {0}")]
    MarkerNotFound(String),

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Manifest construction or parsing error
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Image source (container daemon) error
    #[error("Image source error: {0}")]
    ImageSourceError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Registry answered with an unexpected status
    #[error("Unexpected status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error on a specific path
    #[error("{path}: {source}")]
    PathError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A primary failure together with failures of the cleanup that followed it
    #[error("{0}")]
    Compound(Box<CompoundError>),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CryptError {
    /// Attach a path to an I/O error.
    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CryptError::PathError {
            path: path.into(),
            source,
        }
    }

    /// Combine a primary failure with the errors of its cleanup actions.
    ///
    /// `None` entries are cleanup steps that succeeded. When every cleanup step
    /// succeeded the primary error is returned unchanged.
    pub fn with_cleanup(
        primary: CryptError,
        cleanup: impl IntoIterator<Item = Option<CryptError>>,
    ) -> Self {
        let secondary: Vec<CryptError> = cleanup.into_iter().flatten().collect();
        if secondary.is_empty() {
            primary
        } else {
            CryptError::Compound(Box::new(CompoundError { primary, secondary }))
        }
    }

    /// True when a cleanup step (close, delete) also failed and files may remain on disk.
    pub fn is_cleanup_failure(&self) -> bool {
        matches!(self, CryptError::Compound(_))
    }

    /// The primary cause, looking through compound errors.
    pub fn primary(&self) -> &CryptError {
        match self {
            CryptError::Compound(c) => &c.primary,
            other => other,
        }
    }

    /// True for integrity failures: digest mismatches and authentication failures.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.primary(),
            CryptError::DigestMismatch { .. }
                | CryptError::AuthenticationError(_)
                | CryptError::CipherError(_)
        )
    }

    /// True for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self.primary(), CryptError::TimeoutError(_))
    }
}

/// A failed operation plus the ordered failures of the cleanup that followed.
#[derive(Debug)]
pub struct CompoundError {
    primary: CryptError,
    secondary: Vec<CryptError>,
}

impl CompoundError {
    pub fn primary(&self) -> &CryptError {
        &self.primary
    }

    pub fn secondary(&self) -> &[CryptError] {
        &self.secondary
    }
}

impl fmt::Display for CompoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        for err in &self.secondary {
            write!(f, "; cleanup also failed: {}", err)?;
        }
        Ok(())
    }
}

impl From<serde_json::Error> for CryptError {
    fn from(err: serde_json::Error) -> Self {
        CryptError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CryptError {
    fn from(err: serde_yaml::Error) -> Self {
        CryptError::SerializationError(err.to_string())
    }
}

/// Result type alias for imgcrypt operations
pub type Result<T> = std::result::Result<T, CryptError>;
