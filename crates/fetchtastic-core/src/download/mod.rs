pub mod android;
pub mod firmware;
pub mod repository;

use std::path::{Path, PathBuf};

use fetchtastic_dl::DownloadError;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info};

use crate::{
    constants::{PRERELEASE_DIR, REPO_DOWNLOADS_DIR},
    error::ErrorContext,
    files, version, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Apk,
    Firmware,
    FirmwarePrerelease,
    FirmwarePrereleaseRepo,
    Repository,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ArtifactKind::Apk => "APK",
            ArtifactKind::Firmware => "firmware",
            ArtifactKind::FirmwarePrerelease => "firmware prerelease",
            ArtifactKind::FirmwarePrereleaseRepo => "firmware prerelease repo",
            ArtifactKind::Repository => "repository",
        };
        write!(f, "{label}")
    }
}

/// Per-file outcome communicated back to the orchestrator by value.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub success: bool,
    pub kind: ArtifactKind,
    pub release_tag: Option<String>,
    pub file_path: PathBuf,
    pub url: Option<String>,
    pub size: Option<u64>,
    pub error: Option<String>,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub was_skipped: bool,
    pub extracted_files: Vec<PathBuf>,
}

impl DownloadResult {
    pub fn success(
        kind: ArtifactKind,
        release_tag: Option<String>,
        file_path: PathBuf,
        url: Option<String>,
        size: u64,
        was_skipped: bool,
    ) -> Self {
        Self {
            success: true,
            kind,
            release_tag,
            file_path,
            url,
            size: Some(size),
            error: None,
            http_status: None,
            retryable: false,
            was_skipped,
            extracted_files: Vec::new(),
        }
    }

    pub fn failure(
        kind: ArtifactKind,
        release_tag: Option<String>,
        file_path: PathBuf,
        url: Option<String>,
        err: &DownloadError,
    ) -> Self {
        Self {
            success: false,
            kind,
            release_tag,
            file_path,
            url,
            size: None,
            error: Some(err.to_string()),
            http_status: err.http_status(),
            retryable: err.is_retryable(),
            was_skipped: false,
            extracted_files: Vec::new(),
        }
    }
}

static VERSION_DIR_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v\d+\.\d+\.\d+(\..*)?$").unwrap());

/// Asset names are filenames; anything with a path separator never touches
/// the disk.
pub(crate) fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != ".."
}

/// Enumerate version directories under an artifact root, newest first by
/// release-tuple ordering. `prerelease` and `repo-dls` never participate.
pub fn version_directories(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("listing version directories in {}", root.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() {
            continue;
        }
        if name == PRERELEASE_DIR || name == REPO_DOWNLOADS_DIR {
            continue;
        }
        if VERSION_DIR_RX.is_match(&name) {
            dirs.push(name);
        }
    }

    dirs.sort_by_key(|name| {
        (
            version::release_tuple(name).unwrap_or_default(),
            name.clone(),
        )
    });
    dirs.reverse();
    Ok(dirs)
}

/// Retention: prune version directories past `keep_limit`, never touching
/// `prerelease` or `repo-dls`. Returns the removed directory names.
pub fn cleanup_old_versions(root: &Path, keep_limit: usize) -> Result<Vec<String>> {
    let dirs = version_directories(root)?;
    let mut removed = Vec::new();

    for name in dirs.iter().skip(keep_limit) {
        let dir = root.join(name);
        if files::safe_remove_tree(&dir, root, &format!("old version {name}")) {
            info!("Removed old version: {name}");
            removed.push(name.clone());
        } else {
            error!("Error removing old version {name}");
        }
    }

    Ok(removed)
}

/// First line of a latest-tag tracking file.
pub fn read_latest_tag(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let tag = content.lines().next()?.trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

pub fn write_latest_tag(path: &Path, tag: &str) -> Result<()> {
    files::atomic_write_text(path, &format!("{tag}\n"))
}

/// A tag counts as new when the tracking file is absent or records an older
/// version.
pub fn is_new_version(path: &Path, tag: &str) -> bool {
    match read_latest_tag(path) {
        Some(recorded) => version::compare(tag, &recorded) == std::cmp::Ordering::Greater,
        None => true,
    }
}
