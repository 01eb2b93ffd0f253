//! Content digests.
//!
//! A digest is an algorithm tag plus the hex encoding of a hash over a byte
//! stream, printed as `sha256:<hex>`. Digests address blobs in a registry and
//! double as integrity checks: [`Verifier`] hashes a stream as it is written
//! and reports whether the result matches the digest it was seeded with.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{CryptError, Result};

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
        }
    }

    /// Start an incremental hash.
    pub fn digester(&self) -> Digester {
        Digester::new(*self)
    }
}

/// An immutable content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Canonical (SHA-256) digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut digester = Digester::new(DigestAlgorithm::Sha256);
        digester.update(data);
        digester.finish()
    }

    /// Canonical digest of everything a reader yields.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut digester = Digester::new(DigestAlgorithm::Sha256);
        io::copy(&mut reader, &mut digester)?;
        Ok(digester.finish())
    }

    /// Canonical digest of a file's contents.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| CryptError::path(path, e))?;
        Self::from_reader(io::BufReader::new(file)).map_err(|e| CryptError::path(path, e))
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex part, used as a file name for downloaded blobs.
    pub fn encoded(&self) -> &str {
        &self.hex
    }

    /// A verifier that accepts streamed bytes and checks them against this digest.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            expected: self.clone(),
            digester: Digester::new(self.algorithm),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| CryptError::InvalidDigest(format!("missing algorithm in '{}'", s)))?;

        let algorithm = match algo {
            "sha256" => DigestAlgorithm::Sha256,
            other => {
                return Err(CryptError::InvalidDigest(format!(
                    "unsupported algorithm '{}'",
                    other
                )))
            }
        };

        let valid = hex.len() == algorithm.hex_len()
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(CryptError::InvalidDigest(format!(
                "malformed {} hex in '{}'",
                algo, s
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`Digest`].
pub struct Digester {
    algorithm: DigestAlgorithm,
    hasher: Sha256,
    written: u64,
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> Digest {
        Digest {
            algorithm: self.algorithm,
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Checks streamed bytes against an expected digest.
pub struct Verifier {
    expected: Digest,
    digester: Digester,
}

impl Verifier {
    pub fn update(&mut self, data: &[u8]) {
        self.digester.update(data);
    }

    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Finish hashing and compare.
    ///
    /// Returns `DigestMismatch` carrying both digests when they differ.
    pub fn verify(self) -> Result<Digest> {
        let actual = self.digester.finish();
        if actual == self.expected {
            Ok(actual)
        } else {
            Err(CryptError::DigestMismatch {
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// True if the bytes seen so far hash to the expected digest.
    pub fn verified(&self) -> bool {
        let current = Digest {
            algorithm: self.digester.algorithm,
            hex: hex::encode(self.digester.hasher.clone().finalize()),
        };
        current == self.expected
    }
}

impl Write for Verifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A writer that hashes everything it forwards.
pub struct DigestWriter<W> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digester: Digester::new(DigestAlgorithm::Sha256),
        }
    }

    /// Return the inner writer, the digest of the bytes written, and their count.
    pub fn into_parts(self) -> (W, Digest, u64) {
        let written = self.digester.written();
        (self.inner, self.digester.finish(), written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
