use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::DownloadError,
    http::HttpClient,
    types::{DownloadOptions, DownloadOutcome, DownloadState},
    verify,
};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Raw batch input. Malformed entries (empty url or target) produce a
/// per-index error without aborting the batch.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub url: String,
    pub target_path: PathBuf,
}

/// Concurrent download engine. Parallelism is gated inside `download` with a
/// single semaphore so batch wrappers do not double-gate. Completed renames
/// are checkpoints: cancellation never rolls them back.
pub struct Downloader {
    http: HttpClient,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    max_retries: u32,
    retry_delay: Duration,
    backoff_factor: f64,
}

impl Downloader {
    pub fn new(http: HttpClient, max_concurrent: usize) -> Self {
        Self {
            http,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancel: CancellationToken::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    pub fn with_retry_policy(
        mut self,
        max_retries: u32,
        retry_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Perform a single download attempt: skip-if-valid, stream to a temp
    /// file, verify length, atomically rename, persist the hash sidecar.
    pub async fn download(
        &self,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, DownloadError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::Cancelled)?;

        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let target = &options.target_path;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                DownloadError::fs(format!("creating directory {}", parent.display()), e)
            })?;
        }

        if target_is_complete(target, options.expected_size) {
            debug!("{} already present and valid, skipping", target.display());
            let size = std::fs::metadata(target).map(|m| m.len()).unwrap_or(0);
            return Ok(DownloadOutcome {
                file_path: target.clone(),
                size,
                was_skipped: true,
            });
        }

        let temp_path = temp_path_for(target);
        let result = self.stream_to_temp(options, &temp_path).await;

        match result {
            Ok(downloaded) => {
                tokio::fs::rename(&temp_path, target).await.map_err(|e| {
                    let _ = std::fs::remove_file(&temp_path);
                    DownloadError::fs(format!("renaming into {}", target.display()), e)
                })?;

                let hash_target = target.clone();
                let digest = tokio::task::spawn_blocking(move || verify::sha256_file(&hash_target))
                    .await
                    .map_err(|e| {
                        DownloadError::fs("hashing downloaded file", std::io::Error::other(e))
                    })??;
                verify::write_hash_sidecar(target, &digest)?;

                info!(
                    "Downloaded {} ({} bytes)",
                    target
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| target.display().to_string()),
                    downloaded
                );
                Ok(DownloadOutcome {
                    file_path: target.clone(),
                    size: downloaded,
                    was_skipped: false,
                })
            }
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                Err(err)
            }
        }
    }

    async fn stream_to_temp(
        &self,
        options: &DownloadOptions,
        temp_path: &Path,
    ) -> Result<u64, DownloadError> {
        let filename = options
            .target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let response = self.http.client().get(options.url.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: options.url.clone(),
            });
        }

        let total = response.content_length();
        if let Some(callback) = &options.progress_callback {
            callback(DownloadState::Preparing {
                filename: filename.clone(),
                total,
            });
        }

        let mut file = tokio::fs::File::create(temp_path).await.map_err(|e| {
            DownloadError::fs(format!("creating temp file {}", temp_path.display()), e)
        })?;

        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await.map_err(|e| {
                DownloadError::fs(format!("writing to {}", temp_path.display()), e)
            })?;
            downloaded += chunk.len() as u64;

            if let Some(callback) = &options.progress_callback {
                callback(DownloadState::Progress {
                    filename: filename.clone(),
                    downloaded,
                    total,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::fs(format!("flushing {}", temp_path.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::fs(format!("syncing {}", temp_path.display()), e))?;
        drop(file);

        if let Some(total) = total {
            if downloaded != total {
                return Err(DownloadError::Integrity {
                    path: temp_path.to_path_buf(),
                    reason: format!("expected {total} bytes, received {downloaded}"),
                });
            }
        }
        if let Some(expected) = options.expected_size {
            if expected > 0 && downloaded != expected {
                return Err(DownloadError::Integrity {
                    path: temp_path.to_path_buf(),
                    reason: format!("expected {expected} bytes, received {downloaded}"),
                });
            }
        }

        if let Some(callback) = &options.progress_callback {
            callback(DownloadState::Complete { filename });
        }

        Ok(downloaded)
    }

    /// Retry wrapper: up to `max_retries` additional attempts with
    /// multiplicative backoff. Only retryable errors retry; rate-limit errors
    /// wait until the advertised reset before the next attempt. Cancellation
    /// cuts off both sleeps and remaining attempts.
    pub async fn download_with_retry(
        &self,
        options: &DownloadOptions,
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut delay = self.retry_delay;

        for attempt in 0..=self.max_retries {
            match self.download(options).await {
                Ok(outcome) => {
                    if attempt > 0 {
                        if let Some(callback) = &options.progress_callback {
                            callback(DownloadState::Recovered);
                        }
                    }
                    return Ok(outcome);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    if let Some(callback) = &options.progress_callback {
                        callback(DownloadState::Error);
                    }

                    let wait = retry_wait(&err, delay);
                    warn!(
                        "Attempt {}/{} failed for {}, retrying in {:.1}s: {err}",
                        attempt + 1,
                        self.max_retries + 1,
                        options.url,
                        wait.as_secs_f64()
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = delay.mul_f64(self.backoff_factor);
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("retry loop returns on final attempt")
    }

    /// Batch entry point. Malformed specs yield a per-index error; valid
    /// specs run concurrently under the shared semaphore.
    pub async fn download_many(
        &self,
        specs: &[DownloadSpec],
    ) -> Vec<Result<DownloadOutcome, DownloadError>> {
        let tasks = specs.iter().map(|spec| async move {
            if spec.url.trim().is_empty() {
                return Err(DownloadError::InvalidSpec("missing url".to_string()));
            }
            if spec.target_path.as_os_str().is_empty() {
                return Err(DownloadError::InvalidSpec("missing target path".to_string()));
            }
            let options = DownloadOptions::new(spec.url.clone(), spec.target_path.clone());
            self.download_with_retry(&options).await
        });

        futures_util::future::join_all(tasks).await
    }
}

/// Backoff delay for ordinary retryable errors; rate-limit errors never
/// retry before the advertised reset.
fn retry_wait(err: &DownloadError, backoff_delay: Duration) -> Duration {
    match err {
        DownloadError::RateLimit { reset_at } => {
            let until_reset = (*reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            until_reset + Duration::from_secs(1)
        }
        _ => backoff_delay,
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_millis()
    ));
    PathBuf::from(name)
}

fn target_is_complete(target: &Path, expected_size: Option<u64>) -> bool {
    if !target.is_file() {
        return false;
    }
    if let Some(expected) = expected_size {
        let actual = std::fs::metadata(target).map(|m| m.len()).unwrap_or(0);
        if expected > 0 && actual != expected {
            return false;
        }
    }
    verify::verify_existing(target)
}
