use std::{env, path::PathBuf, time::Duration};

pub const MESHTASTIC_ANDROID_RELEASES_URL: &str =
    "https://api.github.com/repos/meshtastic/Meshtastic-Android/releases";
pub const MESHTASTIC_FIRMWARE_RELEASES_URL: &str =
    "https://api.github.com/repos/meshtastic/firmware/releases";
pub const MESHTASTIC_GITHUB_IO_CONTENTS_URL: &str =
    "https://api.github.com/repos/meshtastic/meshtastic.github.io/contents";
pub const MESHTASTIC_GITHUB_IO_COMMITS_URL: &str =
    "https://api.github.com/repos/meshtastic/meshtastic.github.io/commits";

/// Static file base for repository downloads; relative paths join onto this.
pub const MESHTASTIC_REPO_BASE_URL: &str = "https://meshtastic.github.io/";

pub const APKS_DIR: &str = "apks";
pub const FIRMWARE_DIR: &str = "firmware";
pub const PRERELEASE_DIR: &str = "prerelease";
pub const REPO_DOWNLOADS_DIR: &str = "repo-dls";
pub const FIRMWARE_DIR_PREFIX: &str = "firmware-";

pub const LATEST_ANDROID_RELEASE_FILE: &str = "latest_android_release.txt";
pub const LATEST_FIRMWARE_RELEASE_FILE: &str = "latest_firmware_release.txt";

pub const PRERELEASE_COMMITS_CACHE_FILE: &str = "prerelease_commits_cache.json";
pub const PRERELEASE_COMMIT_HISTORY_FILE: &str = "prerelease_commit_history.json";
pub const PRERELEASE_TRACKING_FILE: &str = "prerelease_tracking.json";
pub const RELEASE_HISTORY_FILE: &str = "release_history.json";

pub const RELEASES_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const COMMITS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_VERSIONS_TO_KEEP: usize = 5;
pub const DEFAULT_PRERELEASE_COMMITS_TO_FETCH: usize = 200;
pub const SHELL_SCRIPT_EXTENSION: &str = ".sh";

fn home_path() -> String {
    env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

pub fn home_config_path() -> String {
    env::var("XDG_CONFIG_HOME").unwrap_or(format!("{}/.config", home_path()))
}

pub fn home_cache_path() -> String {
    env::var("XDG_CACHE_HOME").unwrap_or(format!("{}/.cache", home_path()))
}

/// Platform user-cache directory for fetchtastic's JSON caches.
pub fn default_cache_dir() -> PathBuf {
    PathBuf::from(home_cache_path()).join("fetchtastic")
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(home_config_path())
        .join("fetchtastic")
        .join("config.toml")
}
