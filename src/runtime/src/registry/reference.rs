//! Image reference parsing and registry URL construction.
//!
//! Parses references like `ghcr.io/org/app:v1` into structured components and
//! builds the Registry HTTP API v2 URLs for them.

use std::str::FromStr;

use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};
use reqwest::Url;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host serving the Docker Hub registry API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, optionally with port (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Manifest digest
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `org/app:v1` → docker.io/org/app:v1
    /// - `ghcr.io/org/app:v1` → ghcr.io/org/app:v1
    /// - `localhost:5000/app@sha256:…` → localhost:5000/app@sha256:…
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CryptError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    CryptError::InvalidReference(format!("'{}': {}", reference, e))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // The tag separator is the last colon after the last slash.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            validate_tag(tag)
                .map_err(|msg| CryptError::InvalidReference(format!("'{}': {}", reference, msg)))?;
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry if it looks like a hostname.
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(CryptError::InvalidReference(format!(
                        "empty repository in '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        if name.is_empty() || name.split('/').any(str::is_empty) {
            return Err(CryptError::InvalidReference(format!(
                "invalid repository '{}'",
                name
            )));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// The tag, or `latest` when the reference only pins a digest.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Tag if present, otherwise the digest: the manifest path component.
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Base URL of the registry API.
    ///
    /// Plain HTTP is used when `insecure` is set or the registry is local.
    pub fn api_base(&self, insecure: bool) -> Result<Url> {
        let host = if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            self.registry.as_str()
        };
        let local = host.starts_with("localhost") || host.starts_with("127.0.0.1");
        let scheme = if insecure || local { "http" } else { "https" };

        Url::parse(&format!("{}://{}/", scheme, host)).map_err(|e| {
            CryptError::InvalidReference(format!("registry '{}': {}", self.registry, e))
        })
    }

    /// `GET`/`PUT` URL for this reference's manifest.
    pub fn manifest_url(&self, insecure: bool) -> Result<Url> {
        self.api_url(
            insecure,
            &format!("v2/{}/manifests/{}", self.repository, self.manifest_reference()),
        )
    }

    /// Content-addressed URL of a blob in this repository.
    pub fn blob_url(&self, digest: &Digest, insecure: bool) -> Result<Url> {
        self.api_url(insecure, &format!("v2/{}/blobs/{}", self.repository, digest))
    }

    /// URL that starts a blob upload session.
    pub fn upload_url(&self, insecure: bool) -> Result<Url> {
        self.api_url(insecure, &format!("v2/{}/blobs/uploads/", self.repository))
    }

    fn api_url(&self, insecure: bool, path: &str) -> Result<Url> {
        self.api_base(insecure)?
            .join(path)
            .map_err(|e| CryptError::InvalidReference(format!("{}: {}", self, e)))
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl FromStr for ImageReference {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    if tag.is_empty() || tag.len() > 128 {
        return Err("tag must be 1 to 128 characters".to_string());
    }
    let valid = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid || tag.starts_with(['.', '-']) {
        return Err(format!("invalid tag '{}'", tag));
    }
    Ok(())
}
