pub mod cache;
pub mod config;
pub mod constants;
pub mod download;
pub mod error;
pub mod files;
pub mod history;
pub mod notify;
pub mod orchestrator;
pub mod pattern;
pub mod version;

pub use error::FetchtasticError;

pub type Result<T> = std::result::Result<T, FetchtasticError>;
