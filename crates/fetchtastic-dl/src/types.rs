use std::{path::PathBuf, sync::Arc};

/// Progress events emitted by the download engine. Callers that want async
/// handling are responsible for their own queueing.
#[derive(Debug, Clone)]
pub enum DownloadState {
    Preparing {
        filename: String,
        total: Option<u64>,
    },
    Progress {
        filename: String,
        downloaded: u64,
        total: Option<u64>,
    },
    Complete {
        filename: String,
    },
    Error,
    Recovered,
}

pub type ProgressCallback = Arc<dyn Fn(DownloadState) + Send + Sync>;

/// A single unit of work for the download engine.
#[derive(Clone)]
pub struct DownloadOptions {
    pub url: String,
    pub target_path: PathBuf,
    pub expected_size: Option<u64>,
    pub progress_callback: Option<ProgressCallback>,
}

impl DownloadOptions {
    pub fn new(url: impl Into<String>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            target_path: target_path.into(),
            expected_size: None,
            progress_callback: None,
        }
    }

    pub fn expected_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    pub fn progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadState) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("url", &self.url)
            .field("target_path", &self.target_path)
            .field("expected_size", &self.expected_size)
            .finish_non_exhaustive()
    }
}

/// Outcome of a completed (or skipped) download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    pub size: u64,
    /// The target was already present and valid; no bytes were transferred.
    pub was_skipped: bool,
}
