use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use fetchtastic_dl::github::{Commit, ReleaseCache};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::{
    constants::{default_cache_dir, COMMITS_CACHE_TTL, PRERELEASE_COMMITS_CACHE_FILE, RELEASES_CACHE_TTL},
    error::ErrorContext,
    files, Result,
};

pub fn parse_iso_datetime_utc(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Key→blob JSON cache over a single directory. Writes are atomic; readers
/// treat invalid JSON, a non-object root, a missing or unparsable
/// `cached_at`, or an exceeded TTL as misses.
pub struct CacheStore {
    cache_dir: PathBuf,
    // Short-lived mirror of the commits blob to avoid re-reading in one run.
    commits_mirror: Mutex<Option<(DateTime<Utc>, Vec<Commit>)>>,
}

impl CacheStore {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.unwrap_or_else(default_cache_dir);
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;
        Ok(Self {
            cache_dir,
            commits_mirror: Mutex::new(None),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    pub fn read_json(&self, path: &Path) -> Option<Value> {
        files::read_json(path)
    }

    pub fn atomic_write_json(&self, path: &Path, value: &Value) -> Result<()> {
        files::atomic_write_json(path, value)
    }

    pub fn clear(&self, name: &str) {
        let path = self.path(name);
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                error!("Could not clear cache file {}: {err}", path.display());
            }
        }
    }

    /// Remove every cache blob, including leftover temp files.
    pub fn clear_all(&self) {
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!("Could not read cache directory: {err}");
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") || name.contains(".tmp") {
                if let Err(err) = fs::remove_file(entry.path()) {
                    error!("Could not remove cache file {name}: {err}");
                }
            }
        }
        *self.commits_mirror.lock().unwrap() = None;
    }

    pub fn write_with_expiry(
        &self,
        path: &Path,
        data_key: &str,
        data: Value,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        let mut blob = serde_json::Map::new();
        blob.insert("cached_at".into(), Value::String(now.to_rfc3339()));
        blob.insert("expires_at".into(), Value::String(expires_at.to_rfc3339()));
        blob.insert(data_key.to_string(), data);
        self.atomic_write_json(path, &Value::Object(blob))
    }

    pub fn read_with_expiry(&self, path: &Path, data_key: &str, ttl: Duration) -> Option<Value> {
        let blob = self.read_json(path)?;
        let obj = blob.as_object()?;

        let cached_at = obj
            .get("cached_at")
            .and_then(Value::as_str)
            .and_then(parse_iso_datetime_utc)?;

        let age = Utc::now().signed_duration_since(cached_at);
        if age >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()) {
            debug!("Cache expired for {}", path.display());
            return None;
        }

        if let Some(expires_raw) = obj.get("expires_at").and_then(Value::as_str) {
            let expires_at = parse_iso_datetime_utc(expires_raw)?;
            if Utc::now() > expires_at {
                debug!("Cache expired for {}", path.display());
                return None;
            }
        }

        obj.get(data_key).cloned()
    }

    fn releases_cache_file(&self, key: &str) -> PathBuf {
        self.path(&format!("releases_{key}.json"))
    }

    pub fn read_releases_cache(&self, key: &str) -> Option<Value> {
        self.read_with_expiry(&self.releases_cache_file(key), "releases", RELEASES_CACHE_TTL)
    }

    pub fn write_releases_cache(&self, key: &str, data: &Value) {
        let path = self.releases_cache_file(key);
        if let Err(err) = self.write_with_expiry(&path, "releases", data.clone(), RELEASES_CACHE_TTL)
        {
            warn!("Releases cache write failed for {}: {err}", path.display());
        }
    }

    /// Commits blob, fronted by the in-memory mirror within a run.
    pub fn read_commits_cache(&self) -> Option<Vec<Commit>> {
        let now = Utc::now();

        if let Some((cached_at, commits)) = self.commits_mirror.lock().unwrap().as_ref() {
            let age = now.signed_duration_since(*cached_at);
            if age < chrono::Duration::from_std(COMMITS_CACHE_TTL).unwrap() {
                debug!("Using in-memory prerelease commit cache");
                return Some(commits.clone());
            }
        }

        let path = self.path(PRERELEASE_COMMITS_CACHE_FILE);
        let blob = self.read_json(&path)?;
        let cached_at = blob
            .get("cached_at")
            .and_then(Value::as_str)
            .and_then(parse_iso_datetime_utc)?;
        let age = now.signed_duration_since(cached_at);
        if age >= chrono::Duration::from_std(COMMITS_CACHE_TTL).unwrap() {
            debug!("Commits cache expired (age {}s)", age.num_seconds());
            return None;
        }

        let commits: Vec<Commit> =
            serde_json::from_value(blob.get("commits").cloned()?).ok()?;
        *self.commits_mirror.lock().unwrap() = Some((cached_at, commits.clone()));
        Some(commits)
    }

    pub fn write_commits_cache(&self, commits: &[Commit]) {
        let now = Utc::now();
        let blob = json!({
            "commits": commits,
            "cached_at": now.to_rfc3339(),
        });
        let path = self.path(PRERELEASE_COMMITS_CACHE_FILE);
        if let Err(err) = self.atomic_write_json(&path, &blob) {
            warn!("Commits cache write failed: {err}");
        }
        *self.commits_mirror.lock().unwrap() = Some((now, commits.to_vec()));
    }

    pub fn invalidate_commits_cache(&self) {
        self.clear(PRERELEASE_COMMITS_CACHE_FILE);
        *self.commits_mirror.lock().unwrap() = None;
    }
}

impl ReleaseCache for CacheStore {
    fn read(&self, key: &str) -> Option<Value> {
        self.read_releases_cache(key)
    }

    fn write(&self, key: &str, data: &Value) {
        self.write_releases_cache(key, data);
    }
}
