use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("GitHub API rate limit exhausted, resets at {reset_at}")]
    RateLimit { reset_at: DateTime<Utc> },

    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("filesystem error while {action}: {source}")]
    Filesystem {
        action: String,
        source: std::io::Error,
    },

    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("invalid download spec: {0}")]
    InvalidSpec(String),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether the retry loop is allowed to attempt this operation again.
    /// Server-side trouble (5xx, network, rate limit) retries; everything
    /// local or client-side short-circuits.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::RateLimit { .. } => true,
            Self::Integrity { .. }
            | Self::Filesystem { .. }
            | Self::MalformedResponse { .. }
            | Self::InvalidSpec(_)
            | Self::Cancelled => false,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RateLimit { .. } => Some(403),
            Self::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub(crate) fn fs(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            action: action.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = DownloadError::Status {
            status: 503,
            url: "https://example.com".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), Some(503));
    }

    #[test]
    fn client_errors_are_fatal() {
        let err = DownloadError::Status {
            status: 404,
            url: "https://example.com".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_is_retryable_and_carries_403() {
        let err = DownloadError::RateLimit {
            reset_at: Utc::now(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), Some(403));
    }

    #[test]
    fn filesystem_errors_are_fatal() {
        let err = DownloadError::fs(
            "creating target directory",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_retryable());
        assert_eq!(err.http_status(), None);
    }
}
