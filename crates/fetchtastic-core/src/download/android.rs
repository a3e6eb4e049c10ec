use std::path::PathBuf;

use fetchtastic_dl::{
    downloader::Downloader,
    github::{GithubSource, Release},
    types::{DownloadOptions, ProgressCallback},
};
use tracing::{debug, error, info, warn};

use crate::{
    cache::CacheStore,
    config::Config,
    constants::{APKS_DIR, LATEST_ANDROID_RELEASE_FILE, MESHTASTIC_ANDROID_RELEASES_URL},
    download::{is_safe_filename, ArtifactKind, DownloadResult},
    pattern,
};

/// Planner for Meshtastic Android APK releases. Targets land under the
/// legacy `apks/<tag>/<filename>` layout.
pub struct AndroidDownloader<'a> {
    config: &'a Config,
    cache: &'a CacheStore,
    source: &'a GithubSource,
    engine: &'a Downloader,
    progress: Option<ProgressCallback>,
}

impl<'a> AndroidDownloader<'a> {
    pub fn new(
        config: &'a Config,
        cache: &'a CacheStore,
        source: &'a GithubSource,
        engine: &'a Downloader,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            config,
            cache,
            source,
            engine,
            progress,
        }
    }

    pub fn apks_dir(&self) -> PathBuf {
        self.config.download_dir().join(APKS_DIR)
    }

    fn latest_tag_file(&self) -> PathBuf {
        self.apks_dir().join(LATEST_ANDROID_RELEASE_FILE)
    }

    pub async fn get_releases(&self) -> Vec<Release> {
        let params = [("per_page", "100".to_string())];
        match self
            .source
            .get_releases(MESHTASTIC_ANDROID_RELEASES_URL, &params, Some(self.cache))
            .await
        {
            Ok(releases) => releases,
            Err(err) => {
                error!("Error fetching Android releases: {err}");
                Vec::new()
            }
        }
    }

    /// Download the retained window of releases. Prereleases are skipped
    /// unless CHECK_APK_PRERELEASES is set.
    pub async fn run(&self) -> Vec<DownloadResult> {
        let releases = self.get_releases().await;
        if releases.is_empty() {
            info!("No Android releases found");
            return Vec::new();
        }

        let keep = self.config.android_versions_to_keep;
        let mut results = Vec::new();
        let mut newest_downloaded: Option<String> = None;

        for release in releases
            .iter()
            .filter(|r| !r.prerelease || self.config.check_apk_prereleases)
            .take(keep)
        {
            let release_results = self.download_release(release).await;
            if newest_downloaded.is_none() && release_results.iter().any(|r| r.success) {
                newest_downloaded = Some(release.tag_name.clone());
            }
            results.extend(release_results);
        }

        if let Some(tag) = newest_downloaded {
            self.record_latest_tag(&tag);
        }

        results
    }

    async fn download_release(&self, release: &Release) -> Vec<DownloadResult> {
        let mut results = Vec::new();

        for asset in &release.assets {
            if !pattern::passes(
                &asset.name,
                &self.config.selected_apk_assets,
                &self.config.exclude_patterns,
            ) {
                debug!("Skipping {}: filtered by selection patterns", asset.name);
                continue;
            }
            if !is_safe_filename(&asset.name) {
                warn!("Skipping unsafe asset name {:?}", asset.name);
                continue;
            }

            let target = self.apks_dir().join(&release.tag_name).join(&asset.name);
            let mut options = DownloadOptions::new(asset.download_url.clone(), target.clone())
                .expected_size((asset.size > 0).then_some(asset.size));
            options.progress_callback = self.progress.clone();

            match self.engine.download_with_retry(&options).await {
                Ok(outcome) => {
                    results.push(DownloadResult::success(
                        ArtifactKind::Apk,
                        Some(release.tag_name.clone()),
                        outcome.file_path,
                        Some(asset.download_url.clone()),
                        outcome.size,
                        outcome.was_skipped,
                    ));
                }
                Err(err) => {
                    error!("Failed to download {}: {err}", asset.name);
                    results.push(DownloadResult::failure(
                        ArtifactKind::Apk,
                        Some(release.tag_name.clone()),
                        target,
                        Some(asset.download_url.clone()),
                        &err,
                    ));
                }
            }
        }

        results
    }

    fn record_latest_tag(&self, tag: &str) {
        let tracking = self.latest_tag_file();
        if let Some(parent) = tracking.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if super::is_new_version(&tracking, tag) {
            if let Err(err) = super::write_latest_tag(&tracking, tag) {
                error!("Could not update {}: {err}", tracking.display());
            }
        }
    }

    pub fn cleanup_old_versions(&self) -> Vec<String> {
        super::cleanup_old_versions(&self.apks_dir(), self.config.android_versions_to_keep)
            .unwrap_or_else(|err| {
                error!("Error cleaning up old Android versions: {err}");
                Vec::new()
            })
    }
}
