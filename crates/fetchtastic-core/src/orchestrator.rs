use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use fetchtastic_dl::{
    downloader::Downloader,
    github::GithubSource,
    http::HttpClient,
    types::{DownloadOptions, ProgressCallback},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cache::CacheStore,
    config::Config,
    constants::RELEASE_HISTORY_FILE,
    download::{
        android::AndroidDownloader, firmware::FirmwareDownloader,
        repository::RepositoryDownloader, DownloadResult,
    },
    history::release::ReleaseHistory,
    notify::Notifier,
    Result,
};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_version_tags: Vec<String>,
    pub elapsed: Duration,
    pub failures: Vec<DownloadResult>,
}

/// Wi-Fi gate. Hosts that cannot report their connection state return
/// `Unknown`, which lets the run proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    OnWifi,
    OffWifi,
    Unknown,
}

pub fn probe_wifi_status() -> WifiStatus {
    WifiStatus::Unknown
}

/// Top-level pipeline: Android → firmware → repository, then history update
/// and retention cleanup. Failures inside one stage never prevent the next.
pub struct Orchestrator {
    config: Config,
    cache: CacheStore,
    source: GithubSource,
    engine: Downloader,
    notifier: Notifier,
    force_refresh: bool,
    progress: Option<ProgressCallback>,
    success_results: Vec<DownloadResult>,
    failed_downloads: Vec<DownloadResult>,
}

impl Orchestrator {
    pub fn new(config: Config, cache_dir: Option<PathBuf>) -> Result<Self> {
        let cache = CacheStore::new(cache_dir)?;
        let http = HttpClient::new(config.effective_token())?;
        let source = GithubSource::new(http.clone());
        let engine = Downloader::new(http, config.max_concurrent_downloads).with_retry_policy(
            config.max_download_retries,
            Duration::from_secs_f64(config.download_retry_delay),
            2.0,
        );
        let notifier = Notifier::from_config(&config);

        Ok(Self {
            config,
            cache,
            source,
            engine,
            notifier,
            force_refresh: false,
            progress: None,
            success_results: Vec::new(),
            failed_downloads: Vec::new(),
        })
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.engine.cancellation_token()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        info!("Starting download pipeline...");

        if self.config.wifi_only && probe_wifi_status() == WifiStatus::OffWifi {
            warn!("WIFI_ONLY is set and the host is not on Wi-Fi; skipping all downloads");
            return Ok(self.summarize(started));
        }

        if self.force_refresh {
            info!("Force refresh requested; clearing caches");
            self.cache.clear_all();
        }

        if self.config.save_apks {
            self.process_android().await;
        }
        if self.config.save_firmware {
            self.process_firmware().await;
        }
        if !self.config.repo_paths.is_empty() {
            self.process_repository().await;
        }

        self.retry_failed().await;
        self.cleanup_old_versions();

        let summary = self.summarize(started);
        self.log_summary(&summary);
        self.notifier.notify(&summary).await;
        Ok(summary)
    }

    async fn process_android(&mut self) {
        info!("Processing Android APK downloads...");
        let downloader = AndroidDownloader::new(
            &self.config,
            &self.cache,
            &self.source,
            &self.engine,
            self.progress.clone(),
        );
        let results = downloader.run().await;
        self.record_results(results);
    }

    async fn process_firmware(&mut self) {
        info!("Processing firmware downloads...");
        let downloader = FirmwareDownloader::new(
            &self.config,
            &self.cache,
            &self.source,
            &self.engine,
            self.progress.clone(),
            self.force_refresh,
        );

        let releases = downloader.get_releases().await;
        let results = downloader.run(&releases).await;

        let latest_stable = releases
            .iter()
            .find(|r| !r.prerelease)
            .map(|r| r.tag_name.clone())
            .or_else(|| downloader.latest_tag());

        let prerelease_results = if let Some(latest_stable) = &latest_stable {
            let prerelease_results = if self.config.check_firmware_prereleases {
                Some(downloader.run_prereleases(latest_stable).await)
            } else {
                None
            };
            downloader.remove_promoted_prereleases(latest_stable);
            downloader.cleanup_superseded_prereleases(latest_stable);
            prerelease_results
        } else {
            None
        };

        drop(downloader);

        self.record_results(results);
        if let Some(prerelease_results) = prerelease_results {
            self.record_results(prerelease_results);
        }

        let history = ReleaseHistory::new(&self.cache, RELEASE_HISTORY_FILE);
        let entries = history.update(&releases);
        history.log_status_summary(&entries, "Firmware");
        history.log_channel_summary(
            &releases,
            "Firmware",
            self.config.firmware_versions_to_keep,
        );
        history.log_duplicate_base_versions(&releases, "Firmware");
    }

    async fn process_repository(&mut self) {
        info!("Processing repository downloads...");
        let downloader = RepositoryDownloader::new(
            &self.config,
            &self.source,
            &self.engine,
            self.progress.clone(),
        );
        let results = downloader.run().await;
        self.record_results(results);
    }

    /// Optional second pass over retryable failures.
    async fn retry_failed(&mut self) {
        let retryable: Vec<DownloadResult> = self
            .failed_downloads
            .iter()
            .filter(|r| r.retryable && r.url.is_some())
            .cloned()
            .collect();
        if retryable.is_empty() {
            return;
        }

        info!("Retrying {} failed downloads...", retryable.len());
        for failed in retryable {
            let url = failed.url.clone().expect("filtered on url presence");
            let mut options = DownloadOptions::new(url.clone(), failed.file_path.clone());
            options.progress_callback = self.progress.clone();

            match self.engine.download_with_retry(&options).await {
                Ok(outcome) => {
                    self.failed_downloads
                        .retain(|r| r.file_path != failed.file_path);
                    self.success_results.push(DownloadResult::success(
                        failed.kind,
                        failed.release_tag.clone(),
                        outcome.file_path,
                        Some(url),
                        outcome.size,
                        outcome.was_skipped,
                    ));
                }
                Err(err) => {
                    error!(
                        "Retry failed for {}: {err}",
                        failed.release_tag.as_deref().unwrap_or("<unknown>")
                    );
                }
            }
        }
    }

    fn cleanup_old_versions(&self) {
        if self.config.save_apks {
            let downloader = AndroidDownloader::new(
                &self.config,
                &self.cache,
                &self.source,
                &self.engine,
                None,
            );
            downloader.cleanup_old_versions();
        }
        if self.config.save_firmware {
            let downloader = FirmwareDownloader::new(
                &self.config,
                &self.cache,
                &self.source,
                &self.engine,
                None,
                self.force_refresh,
            );
            downloader.cleanup_old_versions();
        }
    }

    fn record_results(&mut self, results: Vec<DownloadResult>) {
        for result in results {
            if result.success {
                self.success_results.push(result);
            } else {
                self.failed_downloads.push(result);
            }
        }
    }

    fn summarize(&self, started: Instant) -> RunSummary {
        let downloaded = self
            .success_results
            .iter()
            .filter(|r| !r.was_skipped)
            .count();
        let skipped = self
            .success_results
            .iter()
            .filter(|r| r.was_skipped)
            .count();

        let mut new_version_tags: Vec<String> = self
            .success_results
            .iter()
            .filter(|r| !r.was_skipped)
            .filter_map(|r| r.release_tag.clone())
            .collect();
        new_version_tags.sort();
        new_version_tags.dedup();

        RunSummary {
            downloaded,
            skipped,
            failed: self.failed_downloads.len(),
            new_version_tags,
            elapsed: started.elapsed(),
            failures: self.failed_downloads.clone(),
        }
    }

    fn log_summary(&self, summary: &RunSummary) {
        info!("Download pipeline completed");
        info!("Time taken: {:.2} seconds", summary.elapsed.as_secs_f64());
        info!(
            "Downloaded {} files, {} already up to date",
            summary.downloaded, summary.skipped
        );
        if summary.failed > 0 {
            warn!("{} downloads failed:", summary.failed);
            for failure in &summary.failures {
                warn!(
                    "  - {} {} {}: {} (url: {}, status: {}, retryable: {})",
                    failure.kind,
                    failure.release_tag.as_deref().unwrap_or("<unknown>"),
                    failure
                        .file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    failure.error.as_deref().unwrap_or("unknown error"),
                    failure.url.as_deref().unwrap_or("<none>"),
                    failure
                        .http_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    failure.retryable,
                );
            }
        }
    }

    /// Empty the repo-dls mirror on request.
    pub fn clean_repository(&self) -> crate::download::repository::CleanupSummary {
        let downloader =
            RepositoryDownloader::new(&self.config, &self.source, &self.engine, None);
        downloader.clean_repository_directory()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn run_with_no_enabled_stages_produces_empty_summary() {
        let dir = tempdir().unwrap();
        let config = Config {
            download_dir: Some(dir.path().join("meshtastic")),
            ..Config::default()
        };

        let mut orchestrator =
            Orchestrator::new(config, Some(dir.path().join("cache"))).unwrap();
        let summary = orchestrator.run().await.unwrap();

        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.new_version_tags.is_empty());
        assert!(!dir.path().join("meshtastic").join("apks").exists());
        assert!(!dir.path().join("meshtastic").join("firmware").exists());
    }

    #[test]
    fn summary_separates_fresh_skipped_and_failed() {
        let dir = tempdir().unwrap();
        let config = Config {
            download_dir: Some(dir.path().join("meshtastic")),
            ..Config::default()
        };
        let mut orchestrator =
            Orchestrator::new(config, Some(dir.path().join("cache"))).unwrap();

        use crate::download::{ArtifactKind, DownloadResult};
        orchestrator.record_results(vec![
            DownloadResult::success(
                ArtifactKind::Firmware,
                Some("v2.7.13".to_string()),
                dir.path().join("a.zip"),
                None,
                10,
                false,
            ),
            DownloadResult::success(
                ArtifactKind::Firmware,
                Some("v2.7.13".to_string()),
                dir.path().join("b.zip"),
                None,
                10,
                true,
            ),
            DownloadResult::failure(
                ArtifactKind::Apk,
                Some("v2.7.12".to_string()),
                dir.path().join("c.apk"),
                Some("https://example.invalid/c.apk".to_string()),
                &fetchtastic_dl::DownloadError::Status {
                    status: 404,
                    url: "https://example.invalid/c.apk".to_string(),
                },
            ),
        ]);

        let summary = orchestrator.summarize(Instant::now());
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.new_version_tags, vec!["v2.7.13".to_string()]);
        assert_eq!(summary.failures[0].http_status, Some(404));
        assert!(!summary.failures[0].retryable);
    }
}
