//! Verified blob downloads.
//!
//! Each download runs on its own task and reports once through a oneshot
//! channel. A [`Watchdog`] cancels the transfer when no first byte arrives in
//! time or when the body stops making progress; the read loop observes the
//! cancellation at every chunk. Every chunk is hashed as it is written, and a
//! file whose digest does not match is closed and deleted before the error is
//! reported.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use imgcrypt_core::digest::{Digest, Verifier};
use imgcrypt_core::error::{CryptError, Result};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::client::{expect_status, http_error, RegistryClient};
use super::reference::ImageReference;
use crate::image::manifest::MEDIA_TYPE_LAYER;

/// Cancels a token unless its deadline keeps being pushed back.
pub struct Watchdog {
    deadline: watch::Sender<Instant>,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Arm with an initial window of `timeout`.
    pub fn start(token: CancellationToken, timeout: Duration) -> Self {
        let (deadline, mut rx) = watch::channel(Instant::now() + timeout);
        let fired = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let fired = fired.clone();
            async move {
                loop {
                    let current = *rx.borrow_and_update();
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep_until(current) => {
                            fired.store(true, Ordering::SeqCst);
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        });

        Self {
            deadline,
            fired,
            task,
        }
    }

    /// Push the deadline to `timeout` from now.
    pub fn reset(&self, timeout: Duration) {
        self.deadline.send_replace(Instant::now() + timeout);
    }

    /// True if the deadline passed and the token was cancelled.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle to a running blob download.
///
/// Dropping the handle cancels the download.
pub struct BlobDownload {
    digest: Digest,
    token: CancellationToken,
    result: oneshot::Receiver<Result<PathBuf>>,
    _guard: DropGuard,
}

impl BlobDownload {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Abort the transfer; `wait` then reports the cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the verified file, or the reason there is none.
    pub async fn wait(self) -> Result<PathBuf> {
        self.result.await.map_err(|_| {
            CryptError::Other(format!("download of {} ended without a result", self.digest))
        })?
    }
}

impl RegistryClient {
    /// Start downloading blob `digest` of `reference` into `dir/<hex>`.
    pub fn pull_blob(&self, reference: &ImageReference, digest: &Digest, dir: &Path) -> BlobDownload {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let dest = dir.join(digest.encoded());

        let client = self.clone();
        let reference = reference.clone();
        let task_digest = digest.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let result = client
                .download(&reference, &task_digest, dest, task_token)
                .await;
            // The receiver may be gone; the file is already verified or removed.
            let _ = tx.send(result);
        });

        BlobDownload {
            digest: digest.clone(),
            _guard: token.clone().drop_guard(),
            token,
            result: rx,
        }
    }

    async fn download(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        dest: PathBuf,
        token: CancellationToken,
    ) -> Result<PathBuf> {
        let config = self.config().clone();
        let watchdog = Watchdog::start(token.clone(), config.first_byte_timeout());

        let url = reference.blob_url(digest, config.insecure)?;
        let req = self.http().get(url.clone()).header(ACCEPT, MEDIA_TYPE_LAYER);

        let resp = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(cancelled(&watchdog, &url, config.first_byte_timeout())),
            resp = self.send(reference, false, req) => resp?,
        };
        let resp = expect_status(resp, &[StatusCode::OK])?;

        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| CryptError::path(&dest, e))?;
        let mut verifier = digest.verifier();
        let mut progress = Progress::new(digest, resp.content_length());

        let streamed: Result<()> = async {
            let mut body = resp.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Err(cancelled(&watchdog, &url, config.idle_timeout()));
                    }
                    chunk = body.next() => chunk,
                };
                let Some(chunk) = chunk else {
                    return Ok(());
                };
                let chunk = chunk.map_err(http_error)?;
                watchdog.reset(config.idle_timeout());

                verifier.update(&chunk);
                file.write_all(&chunk)
                    .await
                    .map_err(|e| CryptError::path(&dest, e))?;
                progress.advance(chunk.len() as u64);
            }
        }
        .await;

        match streamed.and_then(|()| check(verifier)) {
            Ok(()) => {
                file.flush().await.map_err(|e| CryptError::path(&dest, e))?;
                file.sync_all().await.map_err(|e| CryptError::path(&dest, e))?;
                tracing::info!(digest = %digest, bytes = progress.received, "Blob verified");
                Ok(dest)
            }
            Err(e) => Err(quit_unverified(file, &dest, e).await),
        }
    }
}

fn check(verifier: Verifier) -> Result<()> {
    verifier.verify().map(|_| ())
}

fn cancelled(watchdog: &Watchdog, url: &reqwest::Url, window: Duration) -> CryptError {
    if watchdog.fired() {
        CryptError::TimeoutError(format!("no data from {} within {:?}", url, window))
    } else {
        CryptError::Other(format!("download from {} cancelled", url))
    }
}

/// Close and delete an unverified file, keeping any cleanup failure.
async fn quit_unverified(mut file: tokio::fs::File, path: &Path, err: CryptError) -> CryptError {
    let close = file
        .flush()
        .await
        .err()
        .map(|e| CryptError::path(path, e));
    drop(file);

    let remove = tokio::fs::remove_file(path).await.err().map(|e| {
        CryptError::Other(format!(
            "unverified data was NOT deleted, remove {} manually: {}",
            path.display(),
            e
        ))
    });

    if remove.is_none() {
        tracing::warn!(file = %path.display(), error = %err, "Deleted unverified download");
    }
    CryptError::with_cleanup(err, [close, remove])
}

/// Logs transfer progress at every tenth of the expected size.
struct Progress {
    digest: String,
    total: Option<u64>,
    received: u64,
    next_report: u64,
}

/// Report interval when the size is unknown.
const PROGRESS_STEP_UNKNOWN: u64 = 8 * 1024 * 1024;

impl Progress {
    fn new(digest: &Digest, total: Option<u64>) -> Self {
        let step = Self::step_for(total);
        Self {
            digest: digest.to_string(),
            total,
            received: 0,
            next_report: step,
        }
    }

    fn step_for(total: Option<u64>) -> u64 {
        match total {
            Some(t) if t >= 10 => t / 10,
            Some(_) => u64::MAX,
            None => PROGRESS_STEP_UNKNOWN,
        }
    }

    fn advance(&mut self, n: u64) {
        self.received += n;
        if self.received < self.next_report {
            return;
        }
        match self.total {
            Some(total) => tracing::debug!(
                digest = %self.digest,
                received = self.received,
                total,
                percent = self.received.saturating_mul(100) / total.max(1),
                "Downloading"
            ),
            None => tracing::debug!(digest = %self.digest, received = self.received, "Downloading"),
        }
        let step = Self::step_for(self.total);
        while self.next_report <= self.received {
            self.next_report = self.next_report.saturating_add(step);
        }
    }
}
