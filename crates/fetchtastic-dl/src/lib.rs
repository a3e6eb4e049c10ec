pub mod downloader;
pub mod error;
pub mod github;
pub mod http;
pub mod types;
pub mod verify;

pub use error::DownloadError;
