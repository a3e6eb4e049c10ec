use std::{
    collections::BTreeSet,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    constants::{default_config_path, DEFAULT_VERSIONS_TO_KEEP},
    error::ConfigError,
};

type Result<T> = std::result::Result<T, ConfigError>;

/// Application configuration. Keys match the documented
/// SCREAMING_SNAKE_CASE names in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Base directory for all downloads. Required.
    pub download_dir: Option<PathBuf>,

    pub github_token: Option<String>,

    /// Whether a token from the environment may substitute for a missing
    /// GITHUB_TOKEN entry.
    pub allow_env_token: bool,

    pub save_apks: bool,
    pub save_firmware: bool,

    pub android_versions_to_keep: usize,
    pub firmware_versions_to_keep: usize,

    pub selected_apk_assets: Vec<String>,
    pub selected_firmware_assets: Vec<String>,
    pub selected_prerelease_assets: Vec<String>,
    pub exclude_patterns: Vec<String>,

    /// Deprecated: kept as a fallback for SELECTED_PRERELEASE_ASSETS and as
    /// the firmware ZIP extraction pattern list.
    pub extract_patterns: Vec<String>,
    pub auto_extract: bool,

    pub check_apk_prereleases: bool,
    pub check_firmware_prereleases: bool,

    pub max_concurrent_downloads: usize,
    pub max_download_retries: u32,
    pub download_retry_delay: f64,

    pub wifi_only: bool,

    pub ntfy_server: Option<String>,
    pub ntfy_topic: Option<String>,
    pub notify_on_download_only: bool,

    /// Relative subdirectories of the static site to mirror into
    /// firmware/repo-dls. Empty list skips the repository stage.
    pub repo_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: None,
            github_token: None,
            allow_env_token: true,
            save_apks: false,
            save_firmware: false,
            android_versions_to_keep: DEFAULT_VERSIONS_TO_KEEP,
            firmware_versions_to_keep: DEFAULT_VERSIONS_TO_KEEP,
            selected_apk_assets: Vec::new(),
            selected_firmware_assets: Vec::new(),
            selected_prerelease_assets: Vec::new(),
            exclude_patterns: Vec::new(),
            extract_patterns: Vec::new(),
            auto_extract: false,
            check_apk_prereleases: false,
            check_firmware_prereleases: false,
            max_concurrent_downloads: 5,
            max_download_retries: 3,
            download_retry_delay: 1.0,
            wifi_only: false,
            ntfy_server: None,
            ntfy_topic: None,
            notify_on_download_only: false,
            repo_paths: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default path (or an explicit one), apply
    /// the legacy-key migration, environment overrides, and validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).unwrap_or_else(default_config_path);

        let mut config = match fs::read_to_string(&config_path) {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(ConfigError::IoError(e)),
        };

        if let Ok(dir) = env::var("FETCHTASTIC_DOWNLOAD_DIR") {
            config.download_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(content)?;
        if let Some(table) = value.as_table() {
            warn_unknown_keys(table);
        }

        let mut config: Config = toml::from_str(content)?;
        config.migrate_legacy_keys(&value);
        Ok(config)
    }

    /// Config-migration shim: the legacy single `CHECK_PRERELEASES` flag only
    /// ever drove firmware prerelease scanning, so it maps onto
    /// CHECK_FIRMWARE_PRERELEASES. APK prerelease scanning stays opt-in.
    fn migrate_legacy_keys(&mut self, raw: &toml::Value) {
        let Some(table) = raw.as_table() else { return };

        if let Some(legacy) = table.get("CHECK_PRERELEASES").and_then(toml::Value::as_bool) {
            if !table.contains_key("CHECK_FIRMWARE_PRERELEASES") {
                info!("Migrating legacy CHECK_PRERELEASES to CHECK_FIRMWARE_PRERELEASES");
                self.check_firmware_prereleases = legacy;
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.download_dir.is_none() {
            return Err(ConfigError::MissingDownloadDir);
        }
        if self.max_concurrent_downloads < 1 {
            warn!("MAX_CONCURRENT_DOWNLOADS must be >= 1; clamping to 1");
            self.max_concurrent_downloads = 1;
        }
        if self.download_retry_delay < 0.0 {
            self.download_retry_delay = 0.0;
        }
        Ok(())
    }

    pub fn download_dir(&self) -> &Path {
        self.download_dir
            .as_deref()
            .expect("validated config always carries DOWNLOAD_DIR")
    }

    /// The token used for API calls: the configured one, or the environment's
    /// GITHUB_TOKEN when ALLOW_ENV_TOKEN permits the substitution.
    pub fn effective_token(&self) -> Option<String> {
        if let Some(token) = &self.github_token {
            if !token.trim().is_empty() {
                return Some(token.clone());
            }
        }
        if self.allow_env_token {
            if let Ok(token) = env::var("GITHUB_TOKEN") {
                if !token.trim().is_empty() {
                    return Some(token);
                }
            }
        }
        None
    }

    /// Prerelease asset selection, falling back to the deprecated
    /// EXTRACT_PATTERNS alias when unset.
    pub fn prerelease_patterns(&self) -> &[String] {
        if self.selected_prerelease_assets.is_empty() {
            &self.extract_patterns
        } else {
            &self.selected_prerelease_assets
        }
    }
}

fn warn_unknown_keys(table: &toml::map::Map<String, toml::Value>) {
    static KNOWN: &[&str] = &[
        "DOWNLOAD_DIR",
        "GITHUB_TOKEN",
        "ALLOW_ENV_TOKEN",
        "SAVE_APKS",
        "SAVE_FIRMWARE",
        "ANDROID_VERSIONS_TO_KEEP",
        "FIRMWARE_VERSIONS_TO_KEEP",
        "SELECTED_APK_ASSETS",
        "SELECTED_FIRMWARE_ASSETS",
        "SELECTED_PRERELEASE_ASSETS",
        "EXCLUDE_PATTERNS",
        "EXTRACT_PATTERNS",
        "AUTO_EXTRACT",
        "CHECK_APK_PRERELEASES",
        "CHECK_FIRMWARE_PRERELEASES",
        "CHECK_PRERELEASES",
        "MAX_CONCURRENT_DOWNLOADS",
        "MAX_DOWNLOAD_RETRIES",
        "DOWNLOAD_RETRY_DELAY",
        "WIFI_ONLY",
        "NTFY_SERVER",
        "NTFY_TOPIC",
        "NOTIFY_ON_DOWNLOAD_ONLY",
        "REPO_PATHS",
    ];

    let known: BTreeSet<&str> = KNOWN.iter().copied().collect();
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("Ignoring unknown configuration key: {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert!(!config.save_apks);
        assert!(!config.save_firmware);
        assert!(config.allow_env_token);
        assert_eq!(config.android_versions_to_keep, 5);
        assert_eq!(config.firmware_versions_to_keep, 5);
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.max_download_retries, 3);
        assert_eq!(config.download_retry_delay, 1.0);
        assert!(!config.auto_extract);
        assert!(!config.check_apk_prereleases);
        assert!(!config.check_firmware_prereleases);
        assert!(!config.wifi_only);
    }

    #[test]
    fn parses_documented_keys() {
        let config = Config::from_toml(
            r#"
            DOWNLOAD_DIR = "/srv/meshtastic"
            SAVE_FIRMWARE = true
            SELECTED_FIRMWARE_ASSETS = ["rak4631", "tbeam"]
            EXCLUDE_PATTERNS = ["debug"]
            MAX_CONCURRENT_DOWNLOADS = 3
            "#,
        )
        .unwrap();

        assert_eq!(
            config.download_dir.as_deref(),
            Some(Path::new("/srv/meshtastic"))
        );
        assert!(config.save_firmware);
        assert_eq!(config.selected_firmware_assets, vec!["rak4631", "tbeam"]);
        assert_eq!(config.exclude_patterns, vec!["debug"]);
        assert_eq!(config.max_concurrent_downloads, 3);
    }

    #[test]
    fn legacy_check_prereleases_migrates_to_firmware_only() {
        let config = Config::from_toml(
            r#"
            DOWNLOAD_DIR = "/srv/meshtastic"
            CHECK_PRERELEASES = true
            "#,
        )
        .unwrap();
        assert!(config.check_firmware_prereleases);
        assert!(!config.check_apk_prereleases);
    }

    #[test]
    fn explicit_new_key_wins_over_legacy() {
        let config = Config::from_toml(
            r#"
            DOWNLOAD_DIR = "/srv/meshtastic"
            CHECK_PRERELEASES = true
            CHECK_FIRMWARE_PRERELEASES = false
            "#,
        )
        .unwrap();
        assert!(!config.check_firmware_prereleases);
    }

    #[test]
    fn missing_download_dir_is_a_config_error() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDownloadDir)
        ));
    }

    #[test]
    fn concurrency_is_clamped_to_one() {
        let mut config = Config {
            download_dir: Some(PathBuf::from("/tmp/x")),
            max_concurrent_downloads: 0,
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.max_concurrent_downloads, 1);
    }

    #[test]
    fn extract_patterns_alias_feeds_prerelease_selection() {
        let config = Config {
            extract_patterns: vec!["rak4631".to_string()],
            ..Config::default()
        };
        assert_eq!(config.prerelease_patterns(), ["rak4631".to_string()]);

        let config = Config {
            extract_patterns: vec!["rak4631".to_string()],
            selected_prerelease_assets: vec!["tbeam".to_string()],
            ..Config::default()
        };
        assert_eq!(config.prerelease_patterns(), ["tbeam".to_string()]);
    }
}
