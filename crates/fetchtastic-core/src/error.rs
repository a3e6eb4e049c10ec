use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration")]
    InvalidConfig,

    #[error("DOWNLOAD_DIR is required but not set")]
    MissingDownloadDir,

    #[error("TOML deserialization error: {0}")]
    TomlDeError(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    #[error("IO error reading config: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum FetchtasticError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error while {action}: {source}")]
    IoError {
        action: String,
        source: std::io::Error,
    },

    #[error("Download failed: {0}")]
    DownloadError(#[from] fetchtastic_dl::DownloadError),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Invalid path specified")]
    InvalidPath,

    #[error("{0}")]
    Custom(String),
}

pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> Result<T, FetchtasticError>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> Result<T, FetchtasticError>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| FetchtasticError::IoError {
            action: context(),
            source: err,
        })
    }
}
