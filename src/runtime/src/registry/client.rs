//! Registry HTTP API v2 client.
//!
//! Manifest and blob requests against a single registry, with basic or
//! bearer-token authentication. Blob downloads live in [`super::download`].

use std::sync::{Arc, RwLock};

use imgcrypt_core::config::TransferConfig;
use imgcrypt_core::digest::Digest;
use imgcrypt_core::error::{CryptError, Result};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, RequestBuilder, Response, StatusCode, Url};
use tokio_util::io::ReaderStream;

use super::auth::{BearerChallenge, RegistryAuth, TokenResponse};
use super::reference::ImageReference;
use crate::image::manifest::{BlobEntry, ImageManifest, MEDIA_TYPE_MANIFEST};

/// Header carrying the canonical digest of pushed or fetched content.
const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Client for one registry endpoint. Cheap to clone.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    auth: RegistryAuth,
    config: TransferConfig,
    token: RwLock<Option<String>>,
}

impl RegistryClient {
    pub fn new(config: TransferConfig, auth: RegistryAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .user_agent(concat!("imgcrypt/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CryptError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                auth,
                config,
                token: RwLock::new(None),
            }),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Fetch and parse the manifest of `reference`.
    pub async fn pull_manifest(
        &self,
        reference: &ImageReference,
        staging_dir: std::path::PathBuf,
    ) -> Result<ImageManifest> {
        let url = reference.manifest_url(self.config().insecure)?;
        let req = self
            .http()
            .get(url.clone())
            .header(ACCEPT, MEDIA_TYPE_MANIFEST)
            .timeout(self.config().request_timeout());

        let resp = self.send(reference, false, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK])?;
        let body = resp.bytes().await.map_err(http_error)?;

        let manifest = ImageManifest::from_json(&body, staging_dir)?;
        tracing::info!(
            reference = %reference,
            layers = manifest.layers.len(),
            "Manifest obtained"
        );
        Ok(manifest)
    }

    /// True if the repository already holds `digest`.
    pub async fn blob_exists(&self, reference: &ImageReference, digest: &Digest) -> Result<bool> {
        let url = reference.blob_url(digest, self.config().insecure)?;
        let req = self
            .http()
            .head(url)
            .timeout(self.config().request_timeout());

        let resp = self.send(reference, true, req).await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => expect_status(resp, &[]).map(|_| false),
        }
    }

    /// Upload a staged blob unless the registry already has it.
    ///
    /// Monolithic upload: `POST` opens a session, one `PUT ?digest=` sends the
    /// whole file.
    pub async fn push_blob(&self, reference: &ImageReference, blob: &BlobEntry) -> Result<()> {
        if self.blob_exists(reference, &blob.digest).await? {
            tracing::info!(digest = %blob.digest, "Blob already present, skipping upload");
            return Ok(());
        }

        let upload = reference.upload_url(self.config().insecure)?;
        let req = self
            .http()
            .post(upload.clone())
            .header(CONTENT_LENGTH, 0)
            .timeout(self.config().request_timeout());
        let resp = self.send(reference, true, req).await?;
        let resp = expect_status(resp, &[StatusCode::ACCEPTED])?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CryptError::RegistryError {
                registry: reference.registry.clone(),
                message: "upload session has no Location".to_string(),
            })?;
        let mut target = upload.join(location).map_err(|e| CryptError::RegistryError {
            registry: reference.registry.clone(),
            message: format!("invalid upload location '{}': {}", location, e),
        })?;
        target
            .query_pairs_mut()
            .append_pair("digest", &blob.digest.to_string());

        let path = blob.local_file()?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CryptError::path(path, e))?;
        let req = self
            .http()
            .put(target)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, blob.size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .timeout(self.config().request_timeout());

        let resp = self.send(reference, true, req).await?;
        expect_status(resp, &[StatusCode::CREATED])?;

        tracing::info!(digest = %blob.digest, size = blob.size, "Uploaded blob");
        Ok(())
    }

    /// Upload the manifest and return its digest.
    pub async fn push_manifest(
        &self,
        reference: &ImageReference,
        manifest: &ImageManifest,
    ) -> Result<Digest> {
        let body = manifest.to_json()?;
        let local = Digest::from_bytes(&body);

        let url = reference.manifest_url(self.config().insecure)?;
        let req = self
            .http()
            .put(url)
            .header(CONTENT_TYPE, MEDIA_TYPE_MANIFEST)
            .body(body)
            .timeout(self.config().request_timeout());

        let resp = self.send(reference, true, req).await?;
        let resp = expect_status(resp, &[StatusCode::OK, StatusCode::CREATED])?;

        let digest = match header_digest(&resp) {
            Some(remote) if remote != local => {
                tracing::warn!(local = %local, remote = %remote, "Registry reports a different manifest digest");
                remote
            }
            Some(remote) => remote,
            None => local,
        };

        tracing::info!(reference = %reference, digest = %digest, "Manifest uploaded");
        Ok(digest)
    }

    /// Send a request, exchanging a bearer token and retrying once on `401`.
    ///
    /// Requests with streaming bodies cannot be replayed; their `401` is
    /// returned as is.
    pub(crate) async fn send(
        &self,
        reference: &ImageReference,
        push: bool,
        req: RequestBuilder,
    ) -> Result<Response> {
        let retry = req.try_clone();
        let resp = self.authorize(req).send().await.map_err(http_error)?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let (Some(retry), Some(challenge)) = (retry, challenge) else {
            return Ok(resp);
        };

        let challenge = challenge.with_default_scope(scope(reference, push));
        self.fetch_token(&challenge).await?;
        self.authorize(retry).send().await.map_err(http_error)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self
            .inner
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match token {
            Some(token) => req.bearer_auth(token),
            None => self.inner.auth.apply_basic(req),
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<()> {
        let mut url = Url::parse(&challenge.realm).map_err(|e| {
            CryptError::HttpError(format!("invalid token realm '{}': {}", challenge.realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
        }

        let req = self
            .inner
            .auth
            .apply_basic(self.http().get(url.clone()))
            .timeout(self.config().request_timeout());
        let resp = req.send().await.map_err(http_error)?;
        let resp = expect_status(resp, &[StatusCode::OK])?;
        let token = resp
            .json::<TokenResponse>()
            .await
            .map_err(http_error)?
            .into_token()
            .ok_or_else(|| CryptError::HttpError(format!("no token in response from {}", url)))?;

        tracing::debug!(realm = %challenge.realm, scope = ?challenge.scope, "Obtained bearer token");
        *self.inner.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
        Ok(())
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("auth", &self.inner.auth)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Token scope for `reference`.
fn scope(reference: &ImageReference, push: bool) -> String {
    let actions = if push { "pull,push" } else { "pull" };
    format!("repository:{}:{}", reference.repository, actions)
}

pub(crate) fn http_error(e: reqwest::Error) -> CryptError {
    if e.is_timeout() {
        CryptError::TimeoutError(e.to_string())
    } else {
        CryptError::HttpError(e.to_string())
    }
}

/// Pass `resp` through if its status is one of `allowed`.
pub(crate) fn expect_status(resp: Response, allowed: &[StatusCode]) -> Result<Response> {
    if allowed.contains(&resp.status()) {
        Ok(resp)
    } else {
        Err(CryptError::HttpStatus {
            url: resp.url().to_string(),
            status: resp.status().as_u16(),
        })
    }
}

fn header_digest(resp: &Response) -> Option<Digest> {
    resp.headers()
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}
