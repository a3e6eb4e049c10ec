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
    constants::{
        DEFAULT_PRERELEASE_COMMITS_TO_FETCH, FIRMWARE_DIR, FIRMWARE_DIR_PREFIX,
        LATEST_FIRMWARE_RELEASE_FILE, MESHTASTIC_FIRMWARE_RELEASES_URL,
        MESHTASTIC_GITHUB_IO_CONTENTS_URL, PRERELEASE_DIR,
    },
    download::{is_safe_filename, ArtifactKind, DownloadResult},
    files,
    history::{prerelease::PrereleaseHistory, release::ReleaseHistory},
    pattern, version,
};

/// Planner for Meshtastic firmware releases and the prerelease tree scanned
/// from the static-site repository.
pub struct FirmwareDownloader<'a> {
    config: &'a Config,
    cache: &'a CacheStore,
    source: &'a GithubSource,
    engine: &'a Downloader,
    progress: Option<ProgressCallback>,
    force_refresh: bool,
}

impl<'a> FirmwareDownloader<'a> {
    pub fn new(
        config: &'a Config,
        cache: &'a CacheStore,
        source: &'a GithubSource,
        engine: &'a Downloader,
        progress: Option<ProgressCallback>,
        force_refresh: bool,
    ) -> Self {
        Self {
            config,
            cache,
            source,
            engine,
            progress,
            force_refresh,
        }
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.config.download_dir().join(FIRMWARE_DIR)
    }

    pub fn prerelease_dir(&self) -> PathBuf {
        self.firmware_dir().join(PRERELEASE_DIR)
    }

    fn latest_tag_file(&self) -> PathBuf {
        self.firmware_dir().join(LATEST_FIRMWARE_RELEASE_FILE)
    }

    pub async fn get_releases(&self) -> Vec<Release> {
        let params = [("per_page", "100".to_string())];
        match self
            .source
            .get_releases(MESHTASTIC_FIRMWARE_RELEASES_URL, &params, Some(self.cache))
            .await
        {
            Ok(releases) => releases,
            Err(err) => {
                error!("Error fetching firmware releases: {err}");
                Vec::new()
            }
        }
    }

    /// Download the retained window of firmware releases. The keep window
    /// grows just enough to cover the most recent beta.
    pub async fn run(&self, releases: &[Release]) -> Vec<DownloadResult> {
        if releases.is_empty() {
            info!("No firmware releases found");
            return Vec::new();
        }

        let history = ReleaseHistory::new(self.cache, crate::constants::RELEASE_HISTORY_FILE);
        let keep = history
            .expand_keep_limit_to_include_beta(releases, self.config.firmware_versions_to_keep);

        let mut results = Vec::new();
        let mut newest_downloaded: Option<String> = None;

        for release in releases
            .iter()
            .filter(|r| !r.prerelease || self.config.check_firmware_prereleases)
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
        let release_dir = self.firmware_dir().join(&release.tag_name);
        let mut results = Vec::new();

        let selected: Vec<_> = release
            .assets
            .iter()
            .filter(|asset| {
                pattern::passes(
                    &asset.name,
                    &self.config.selected_firmware_assets,
                    &self.config.exclude_patterns,
                )
            })
            .collect();
        if selected.is_empty() {
            info!(
                "Release {} found, but no assets matched current selection/exclude filters",
                release.tag_name
            );
            return results;
        }

        self.write_release_notes(release, &release_dir);

        for asset in selected {
            if !is_safe_filename(&asset.name) {
                warn!("Skipping unsafe asset name {:?}", asset.name);
                continue;
            }

            let target = release_dir.join(&asset.name);
            let mut options = DownloadOptions::new(asset.download_url.clone(), target.clone())
                .expected_size((asset.size > 0).then_some(asset.size));
            options.progress_callback = self.progress.clone();

            match self.engine.download_with_retry(&options).await {
                Ok(outcome) => {
                    let mut result = DownloadResult::success(
                        ArtifactKind::Firmware,
                        Some(release.tag_name.clone()),
                        outcome.file_path.clone(),
                        Some(asset.download_url.clone()),
                        outcome.size,
                        outcome.was_skipped,
                    );
                    result.extracted_files = self.maybe_extract(&outcome.file_path, &release_dir);
                    results.push(result);
                }
                Err(err) => {
                    error!("Failed to download {}: {err}", asset.name);
                    results.push(DownloadResult::failure(
                        ArtifactKind::Firmware,
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

    /// Firmware ZIP extraction, when configured. Idempotent: nothing happens
    /// when every pattern-matching entry already exists in the release dir.
    fn maybe_extract(&self, archive: &std::path::Path, release_dir: &std::path::Path) -> Vec<PathBuf> {
        if !self.config.auto_extract || self.config.extract_patterns.is_empty() {
            return Vec::new();
        }
        if archive
            .extension()
            .is_none_or(|ext| !ext.eq_ignore_ascii_case("zip"))
        {
            return Vec::new();
        }

        match files::extraction_needed(
            archive,
            release_dir,
            &self.config.extract_patterns,
            &self.config.exclude_patterns,
        ) {
            Ok(false) => return Vec::new(),
            Ok(true) => {}
            Err(err) => {
                warn!("Could not inspect {} for extraction: {err}", archive.display());
                return Vec::new();
            }
        }

        match files::extract_archive(
            archive,
            release_dir,
            &self.config.extract_patterns,
            &self.config.exclude_patterns,
        ) {
            Ok(extracted) => {
                if !extracted.is_empty() {
                    info!(
                        "Extracted {} files from {}",
                        extracted.len(),
                        archive.display()
                    );
                }
                extracted
            }
            Err(err) => {
                error!("Error extracting {}: {err}", archive.display());
                Vec::new()
            }
        }
    }

    fn write_release_notes(&self, release: &Release, release_dir: &std::path::Path) {
        let Some(body) = &release.body else { return };
        if body.trim().is_empty() {
            return;
        }

        let notes_path = release_dir.join(format!("release_notes-{}.md", release.tag_name));
        if notes_path.exists() {
            return;
        }
        if let Err(err) = std::fs::create_dir_all(release_dir) {
            warn!("Could not create {}: {err}", release_dir.display());
            return;
        }
        if let Err(err) = files::atomic_write_text(&notes_path, &files::strip_non_ascii(body)) {
            warn!("Could not write release notes for {}: {err}", release.tag_name);
        }
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

    pub fn latest_tag(&self) -> Option<String> {
        super::read_latest_tag(&self.latest_tag_file())
    }

    /// Scan the static-site repo for the newest active prerelease of the
    /// next patch window and mirror its matching files.
    pub async fn run_prereleases(&self, latest_stable_tag: &str) -> Vec<DownloadResult> {
        let Some(expected_base) = version::expected_next_patch(latest_stable_tag) else {
            warn!("Cannot derive prerelease window from tag {latest_stable_tag:?}");
            return Vec::new();
        };

        let history = PrereleaseHistory::new(self.cache);
        let Some(newest_dir) = history
            .find_latest_remote_dir(
                self.source,
                &expected_base,
                self.force_refresh,
                DEFAULT_PRERELEASE_COMMITS_TO_FETCH,
            )
            .await
        else {
            info!("No prerelease directories found for {expected_base}");
            return Vec::new();
        };

        let listing_url = format!("{MESHTASTIC_GITHUB_IO_CONTENTS_URL}/{newest_dir}");
        let entries = match self.source.list_directory(&listing_url).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Could not list prerelease directory {newest_dir}: {err}");
                return Vec::new();
            }
        };

        let target_dir = self.prerelease_dir().join(&newest_dir);
        let mut results = Vec::new();

        for entry in entries.into_iter().filter(|e| e.is_file) {
            if !pattern::passes(
                &entry.name,
                self.config.prerelease_patterns(),
                &self.config.exclude_patterns,
            ) {
                continue;
            }
            if !is_safe_filename(&entry.name) {
                warn!("Skipping unsafe prerelease file name {:?}", entry.name);
                continue;
            }
            let Some(url) = entry.download_url else {
                debug!("Prerelease entry {} has no download URL", entry.name);
                continue;
            };

            let target = target_dir.join(&entry.name);
            let mut options = DownloadOptions::new(url.clone(), target.clone())
                .expected_size((entry.size > 0).then_some(entry.size));
            options.progress_callback = self.progress.clone();

            match self.engine.download_with_retry(&options).await {
                Ok(outcome) => results.push(DownloadResult::success(
                    ArtifactKind::FirmwarePrerelease,
                    Some(newest_dir.clone()),
                    outcome.file_path,
                    Some(url),
                    outcome.size,
                    outcome.was_skipped,
                )),
                Err(err) => {
                    error!("Failed to download prerelease file {}: {err}", entry.name);
                    results.push(DownloadResult::failure(
                        ArtifactKind::FirmwarePrerelease,
                        Some(newest_dir.clone()),
                        target,
                        Some(url),
                        &err,
                    ));
                }
            }
        }

        history.update_legacy_tracking(latest_stable_tag, &newest_dir);
        results
    }

    /// Remove prerelease directories whose `(X, Y, Z)` is at or below the
    /// stable release's version.
    pub fn cleanup_superseded_prereleases(&self, latest_stable_tag: &str) -> Vec<String> {
        let Some(stable_tuple) = version::release_tuple(latest_stable_tag) else {
            return Vec::new();
        };
        let prerelease_dir = self.prerelease_dir();
        let Ok(entries) = std::fs::read_dir(&prerelease_dir) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(FIRMWARE_DIR_PREFIX) else {
                continue;
            };
            let Some(dir_tuple) = version::release_tuple(suffix) else {
                continue;
            };
            let dir_base: Vec<u64> = dir_tuple.into_iter().take(3).collect();
            if dir_base.len() < 3 {
                continue;
            }

            if dir_base <= stable_tuple
                && files::safe_remove_tree(&entry.path(), &prerelease_dir, &name)
            {
                info!("Removed superseded prerelease: {name}");
                removed.push(name);
            }
        }
        removed
    }

    /// Promotion detection: a prerelease directory whose base equals the
    /// current stable tag and whose files all hash-match the stable release
    /// has been promoted; delete it.
    pub fn remove_promoted_prereleases(&self, latest_stable_tag: &str) -> Vec<String> {
        let stable_base = version::extract_clean_version(latest_stable_tag)
            .map(|v| v.trim_start_matches(['v', 'V']).to_string());
        let Some(stable_base) = stable_base else {
            return Vec::new();
        };
        let stable_dir = self.firmware_dir().join(version::ensure_v_prefix(latest_stable_tag));

        let prerelease_dir = self.prerelease_dir();
        let Ok(entries) = std::fs::read_dir(&prerelease_dir) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(FIRMWARE_DIR_PREFIX) else {
                continue;
            };
            let parts: Vec<&str> = suffix.split('.').collect();
            if parts.len() < 3 || parts[..3].join(".") != stable_base {
                continue;
            }

            if self.prerelease_matches_stable(&entry.path(), &stable_dir)
                && files::safe_remove_tree(&entry.path(), &prerelease_dir, &name)
            {
                info!("Removed promoted prerelease: {name}");
                removed.push(name);
            }
        }
        removed
    }

    /// Every file present in both trees must hash-match; at least one shared
    /// file is required for a promotion verdict.
    fn prerelease_matches_stable(
        &self,
        prerelease_path: &std::path::Path,
        stable_dir: &std::path::Path,
    ) -> bool {
        let Ok(entries) = std::fs::read_dir(prerelease_path) else {
            return false;
        };

        let mut compared = 0usize;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".sha256") {
                continue;
            }
            let stable_file = stable_dir.join(&name);
            if !stable_file.is_file() {
                continue;
            }
            if !files::compare_file_hashes(&path, &stable_file) {
                return false;
            }
            compared += 1;
        }

        compared > 0
    }

    pub fn cleanup_old_versions(&self) -> Vec<String> {
        super::cleanup_old_versions(&self.firmware_dir(), self.config.firmware_versions_to_keep)
            .unwrap_or_else(|err| {
                error!("Error cleaning up old firmware versions: {err}");
                Vec::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fetchtastic_dl::{github::Asset, http::HttpClient};
    use tempfile::tempdir;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn test_config(download_dir: &Path) -> Config {
        Config {
            download_dir: Some(download_dir.to_path_buf()),
            save_firmware: true,
            selected_firmware_assets: vec!["rak4631".to_string()],
            extract_patterns: vec!["rak4631".to_string()],
            ..Config::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        cache: CacheStore,
        source: GithubSource,
        engine: Downloader,
    }

    fn fixture_with(config_fn: impl FnOnce(&Path) -> Config) -> Fixture {
        let dir = tempdir().unwrap();
        let config = config_fn(&dir.path().join("meshtastic"));
        let cache = CacheStore::new(Some(dir.path().join("cache"))).unwrap();
        let http = HttpClient::without_api_delay(None).unwrap();
        let source = GithubSource::new(http.clone());
        let engine = Downloader::new(http, 2)
            .with_retry_policy(1, std::time::Duration::from_millis(10), 2.0);
        Fixture {
            _dir: dir,
            config,
            cache,
            source,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config)
    }

    fn downloader(fixture: &Fixture) -> FirmwareDownloader<'_> {
        FirmwareDownloader::new(
            &fixture.config,
            &fixture.cache,
            &fixture.source,
            &fixture.engine,
            None,
            false,
        )
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn release(tag: &str, server_uri: &str, asset_name: &str, size: u64) -> Release {
        Release {
            tag_name: tag.to_string(),
            prerelease: false,
            published_at: Some("2025-06-01T00:00:00Z".to_string()),
            name: None,
            body: Some("Release notes with unicode \u{1F980} content".to_string()),
            assets: vec![Asset {
                name: asset_name.to_string(),
                download_url: format!("{server_uri}/{asset_name}"),
                size,
                content_type: None,
            }],
        }
    }

    #[tokio::test]
    async fn firmware_release_downloads_extracts_and_writes_notes() {
        let fixture = fixture();
        let server = MockServer::start().await;
        let archive = zip_bytes(&[
            ("firmware-rak4631-2.7.13.bin", b"rak-bits"),
            ("firmware-tbeam-2.7.13.bin", b"tbeam-bits"),
        ]);
        Mock::given(method("GET"))
            .and(path("/firmware-rak4631-2.7.13.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.clone()))
            .mount(&server)
            .await;

        let mut config = fixture.config.clone();
        config.auto_extract = true;
        let dl = FirmwareDownloader::new(
            &config,
            &fixture.cache,
            &fixture.source,
            &fixture.engine,
            None,
            false,
        );

        let release = release(
            "v2.7.13",
            &server.uri(),
            "firmware-rak4631-2.7.13.zip",
            archive.len() as u64,
        );
        let results = dl.download_release(&release).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let release_dir = config.download_dir().join("firmware").join("v2.7.13");
        assert!(release_dir.join("firmware-rak4631-2.7.13.zip").exists());
        // Only the pattern-matching entry got extracted.
        assert!(release_dir.join("firmware-rak4631-2.7.13.bin").exists());
        assert!(!release_dir.join("firmware-tbeam-2.7.13.bin").exists());
        assert_eq!(results[0].extracted_files.len(), 1);

        // Release notes materialize with non-ASCII stripped.
        let notes = std::fs::read_to_string(release_dir.join("release_notes-v2.7.13.md")).unwrap();
        assert!(notes.contains("Release notes with unicode"));
        assert!(notes.is_ascii());
    }

    #[tokio::test]
    async fn no_matching_assets_produces_no_results() {
        let fixture = fixture();
        let dl = downloader(&fixture);
        let release = release("v2.7.13", "http://unused.invalid", "firmware-tbeam.zip", 5);
        let results = dl.download_release(&release).await;
        assert!(results.is_empty());
        assert!(!fixture.config.download_dir().join("firmware").join("v2.7.13").exists());
    }

    #[test]
    fn superseded_prereleases_are_pruned() {
        let fixture = fixture();
        let dl = downloader(&fixture);
        let prerelease = dl.prerelease_dir();
        for name in [
            "firmware-2.7.12.aaa111",
            "firmware-2.7.13.bbb222",
            "firmware-2.7.14.ccc333",
        ] {
            std::fs::create_dir_all(prerelease.join(name)).unwrap();
        }

        let mut removed = dl.cleanup_superseded_prereleases("v2.7.13");
        removed.sort();
        assert_eq!(
            removed,
            vec!["firmware-2.7.12.aaa111", "firmware-2.7.13.bbb222"]
        );
        assert!(prerelease.join("firmware-2.7.14.ccc333").exists());
    }

    #[test]
    fn promotion_removes_prerelease_only_when_hashes_match() {
        let fixture = fixture();
        let dl = downloader(&fixture);

        let stable = dl.firmware_dir().join("v2.7.13");
        let promoted = dl.prerelease_dir().join("firmware-2.7.13.abcdef");
        let diverged = dl.prerelease_dir().join("firmware-2.7.13.123456");
        std::fs::create_dir_all(&stable).unwrap();
        std::fs::create_dir_all(&promoted).unwrap();
        std::fs::create_dir_all(&diverged).unwrap();

        std::fs::write(stable.join("firmware.bin"), b"identical").unwrap();
        std::fs::write(promoted.join("firmware.bin"), b"identical").unwrap();
        std::fs::write(diverged.join("firmware.bin"), b"different").unwrap();

        let removed = dl.remove_promoted_prereleases("v2.7.13");
        assert_eq!(removed, vec!["firmware-2.7.13.abcdef"]);
        assert!(!promoted.exists());
        assert!(diverged.exists());
        assert!(stable.join("firmware.bin").exists());
    }

    #[test]
    fn promotion_requires_at_least_one_shared_file() {
        let fixture = fixture();
        let dl = downloader(&fixture);

        let stable = dl.firmware_dir().join("v2.7.13");
        let empty_overlap = dl.prerelease_dir().join("firmware-2.7.13.fedcba");
        std::fs::create_dir_all(&stable).unwrap();
        std::fs::create_dir_all(&empty_overlap).unwrap();
        std::fs::write(empty_overlap.join("only-here.bin"), b"data").unwrap();

        let removed = dl.remove_promoted_prereleases("v2.7.13");
        assert!(removed.is_empty());
        assert!(empty_overlap.exists());
    }
}
