use std::path::{Component, Path, PathBuf};

use fetchtastic_dl::{
    downloader::Downloader,
    github::{GithubSource, RepoEntry},
    types::{DownloadOptions, ProgressCallback},
};
use tracing::{error, info, warn};
use url::Url;

use crate::{
    config::Config,
    constants::{
        FIRMWARE_DIR, MESHTASTIC_GITHUB_IO_CONTENTS_URL, MESHTASTIC_REPO_BASE_URL,
        REPO_DOWNLOADS_DIR, SHELL_SCRIPT_EXTENSION,
    },
    download::{is_safe_filename, ArtifactKind, DownloadResult},
    files,
};

#[derive(Debug, Default, Clone)]
pub struct CleanupSummary {
    pub removed_files: usize,
    pub removed_dirs: usize,
    pub errors: Vec<String>,
    pub success: bool,
}

/// Planner for files mirrored from the meshtastic.github.io static site into
/// `firmware/repo-dls`.
pub struct RepositoryDownloader<'a> {
    config: &'a Config,
    source: &'a GithubSource,
    engine: &'a Downloader,
    progress: Option<ProgressCallback>,
}

impl<'a> RepositoryDownloader<'a> {
    pub fn new(
        config: &'a Config,
        source: &'a GithubSource,
        engine: &'a Downloader,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            config,
            source,
            engine,
            progress,
        }
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.config
            .download_dir()
            .join(FIRMWARE_DIR)
            .join(REPO_DOWNLOADS_DIR)
    }

    /// Fetch file entries for a subdirectory of the static site repository;
    /// empty string lists the root.
    pub async fn get_repository_files(&self, subdirectory: &str) -> Vec<RepoEntry> {
        let subdirectory = subdirectory.trim_matches('/');
        let url = if subdirectory.is_empty() {
            MESHTASTIC_GITHUB_IO_CONTENTS_URL.to_string()
        } else {
            format!("{MESHTASTIC_GITHUB_IO_CONTENTS_URL}/{subdirectory}")
        };

        match self.source.list_directory(&url).await {
            Ok(entries) => {
                let files: Vec<RepoEntry> = entries.into_iter().filter(|e| e.is_file).collect();
                info!(
                    "Fetched {} repository files from {}",
                    files.len(),
                    if subdirectory.is_empty() { "root" } else { subdirectory }
                );
                files
            }
            Err(err) => {
                error!("Error fetching repository files: {err}");
                Vec::new()
            }
        }
    }

    /// Mirror every configured repository path. Files are filtered through
    /// the global exclude patterns.
    pub async fn run(&self) -> Vec<DownloadResult> {
        let mut results = Vec::new();
        for subdirectory in &self.config.repo_paths {
            let entries = self.get_repository_files(subdirectory).await;
            for entry in entries {
                if crate::pattern::matches_exclude(&entry.name, &self.config.exclude_patterns) {
                    continue;
                }
                results.push(self.download_file(&entry, subdirectory).await);
            }
        }
        results
    }

    pub async fn download_file(&self, entry: &RepoEntry, subdirectory: &str) -> DownloadResult {
        let target_dir = self.safe_target_directory(subdirectory);

        if !is_safe_filename(&entry.name) {
            let err = fetchtastic_dl::DownloadError::InvalidSpec(format!(
                "unsafe repository filename {:?}",
                entry.name
            ));
            return DownloadResult::failure(
                ArtifactKind::Repository,
                None,
                target_dir,
                entry.download_url.clone(),
                &err,
            );
        }

        let url = match self.resolve_download_url(entry) {
            Ok(url) => url,
            Err(err) => {
                return DownloadResult::failure(
                    ArtifactKind::Repository,
                    None,
                    target_dir.join(&entry.name),
                    entry.download_url.clone(),
                    &err,
                );
            }
        };

        let target = target_dir.join(&entry.name);
        let mut options = DownloadOptions::new(url.clone(), target.clone())
            .expected_size((entry.size > 0).then_some(entry.size));
        options.progress_callback = self.progress.clone();

        match self.engine.download_with_retry(&options).await {
            Ok(outcome) => {
                if entry.name.to_lowercase().ends_with(SHELL_SCRIPT_EXTENSION) {
                    if let Err(err) = files::set_executable(&outcome.file_path) {
                        warn!(
                            "Error setting permissions for {}: {err}",
                            outcome.file_path.display()
                        );
                    }
                }
                DownloadResult::success(
                    ArtifactKind::Repository,
                    None,
                    outcome.file_path,
                    Some(url),
                    outcome.size,
                    outcome.was_skipped,
                )
            }
            Err(err) => {
                error!("Failed to download repository file {}: {err}", entry.name);
                DownloadResult::failure(ArtifactKind::Repository, None, target, Some(url), &err)
            }
        }
    }

    fn resolve_download_url(
        &self,
        entry: &RepoEntry,
    ) -> Result<String, fetchtastic_dl::DownloadError> {
        if let Some(url) = &entry.download_url {
            if !url.trim().is_empty() {
                return Ok(url.clone());
            }
        }

        let base = Url::parse(MESHTASTIC_REPO_BASE_URL).map_err(|e| {
            fetchtastic_dl::DownloadError::InvalidSpec(format!("invalid base URL: {e}"))
        })?;
        base.join(entry.path.trim_start_matches('/'))
            .map(|u| u.to_string())
            .map_err(|e| {
                fetchtastic_dl::DownloadError::InvalidSpec(format!(
                    "cannot build URL for {}: {e}",
                    entry.path
                ))
            })
    }

    /// Resolve a target directory inside repo-dls. Subdirectories that are
    /// absolute, contain traversal components, or escape the base after
    /// symlink resolution fall back to the repo-dls root.
    fn safe_target_directory(&self, subdirectory: &str) -> PathBuf {
        let base = self.repo_dir();
        let _ = std::fs::create_dir_all(&base);

        let subdirectory = subdirectory.trim_matches('/');
        if subdirectory.is_empty() {
            return base;
        }
        if !self.is_safe_subdirectory(subdirectory) {
            warn!(
                "Sanitized unsafe repository subdirectory {subdirectory:?}; \
                 using base repo directory"
            );
            return base;
        }

        let target = base.join(subdirectory);
        if std::fs::create_dir_all(&target).is_err() {
            return base;
        }

        // Containment check after symlink resolution.
        match (base.canonicalize(), target.canonicalize()) {
            (Ok(canonical_base), Ok(canonical_target))
                if canonical_target.starts_with(&canonical_base) =>
            {
                target
            }
            _ => {
                warn!(
                    "Repository subdirectory {subdirectory:?} escapes repo-dls; \
                     using base repo directory"
                );
                base
            }
        }
    }

    fn is_safe_subdirectory(&self, subdirectory: &str) -> bool {
        if subdirectory.contains('\\') || subdirectory.contains('~') {
            return false;
        }
        let path = Path::new(subdirectory);
        if path.is_absolute() {
            return false;
        }
        path.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    }

    /// Empty the repository downloads directory. Missing directory counts as
    /// success.
    pub fn clean_repository_directory(&self) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        let repo_dir = self.repo_dir();

        if !repo_dir.exists() {
            info!("Repository downloads directory does not exist - nothing to clean");
            summary.success = true;
            return summary;
        }

        let entries = match std::fs::read_dir(&repo_dir) {
            Ok(entries) => entries,
            Err(err) => {
                summary.errors.push(err.to_string());
                return summary;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let result = if path.is_dir() && !path.is_symlink() {
                std::fs::remove_dir_all(&path).map(|()| summary.removed_dirs += 1)
            } else {
                std::fs::remove_file(&path).map(|()| summary.removed_files += 1)
            };
            if let Err(err) = result {
                error!("Error removing {}: {err}", path.display());
                summary.errors.push(format!("{}: {err}", path.display()));
                return summary;
            }
        }

        info!("Cleaned repository directory: {}", repo_dir.display());
        summary.success = true;
        summary
    }
}

#[cfg(test)]
mod tests {
    use fetchtastic_dl::http::HttpClient;
    use tempfile::tempdir;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        source: GithubSource,
        engine: Downloader,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = Config {
            download_dir: Some(dir.path().join("meshtastic")),
            ..Config::default()
        };
        let http = HttpClient::without_api_delay(None).unwrap();
        let source = GithubSource::new(http.clone());
        let engine = Downloader::new(http, 2)
            .with_retry_policy(1, std::time::Duration::from_millis(10), 2.0);
        Fixture {
            _dir: dir,
            config,
            source,
            engine,
        }
    }

    fn downloader(fixture: &Fixture) -> RepositoryDownloader<'_> {
        RepositoryDownloader::new(&fixture.config, &fixture.source, &fixture.engine, None)
    }

    fn entry(name: &str, url: Option<&str>, size: u64) -> RepoEntry {
        RepoEntry {
            name: name.to_string(),
            path: name.to_string(),
            download_url: url.map(str::to_string),
            size,
            is_file: true,
        }
    }

    #[tokio::test]
    async fn repository_file_lands_under_repo_dls() {
        let fixture = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device-install.sh"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"#!/bin/sh\n".to_vec()))
            .mount(&server)
            .await;

        let dl = downloader(&fixture);
        let result = dl
            .download_file(
                &entry(
                    "device-install.sh",
                    Some(&format!("{}/device-install.sh", server.uri())),
                    10,
                ),
                "scripts",
            )
            .await;

        assert!(result.success);
        let expected = fixture
            .config
            .download_dir()
            .join("firmware")
            .join("repo-dls")
            .join("scripts")
            .join("device-install.sh");
        assert!(expected.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&expected).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[tokio::test]
    async fn traversal_subdirectories_fall_back_to_repo_root() {
        let fixture = fixture();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
            .mount(&server)
            .await;

        let dl = downloader(&fixture);
        for unsafe_sub in ["../../escape", "/abs", "a/../../b", "with\\backslash", "~home"] {
            let result = dl
                .download_file(
                    &entry("file.bin", Some(&format!("{}/file.bin", server.uri())), 4),
                    unsafe_sub,
                )
                .await;
            assert!(result.success, "subdirectory {unsafe_sub:?}");

            // The file must resolve inside repo-dls regardless of input.
            let repo_root = dl.repo_dir().canonicalize().unwrap();
            let resolved = result.file_path.canonicalize().unwrap();
            assert!(
                resolved.starts_with(&repo_root),
                "{} escaped repo-dls for {unsafe_sub:?}",
                resolved.display()
            );
            assert_eq!(resolved, repo_root.join("file.bin"));
        }
    }

    #[tokio::test]
    async fn relative_url_joins_onto_static_base() {
        let fixture = fixture();
        let dl = downloader(&fixture);
        let url = dl
            .resolve_download_url(&entry("index.html", None, 1))
            .unwrap();
        assert_eq!(url, "https://meshtastic.github.io/index.html");
    }

    #[test]
    fn clean_repository_directory_reports_counts() {
        let fixture = fixture();
        let dl = downloader(&fixture);
        let repo = dl.repo_dir();
        std::fs::create_dir_all(repo.join("subdir")).unwrap();
        std::fs::write(repo.join("a.bin"), b"a").unwrap();
        std::fs::write(repo.join("subdir").join("b.bin"), b"b").unwrap();

        let summary = dl.clean_repository_directory();
        assert!(summary.success);
        assert_eq!(summary.removed_files, 1);
        assert_eq!(summary.removed_dirs, 1);
        assert!(std::fs::read_dir(&repo).unwrap().next().is_none());

        // A second clean over the now-missing tree still succeeds.
        std::fs::remove_dir_all(&repo).unwrap();
        assert!(dl.clean_repository_directory().success);
    }
}
