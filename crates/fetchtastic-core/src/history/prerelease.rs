use std::collections::BTreeSet;

use chrono::Utc;
use fetchtastic_dl::github::{Commit, GithubSource};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    cache::{parse_iso_datetime_utc, CacheStore},
    constants::{
        COMMITS_CACHE_TTL, FIRMWARE_DIR_PREFIX, MESHTASTIC_GITHUB_IO_COMMITS_URL,
        MESHTASTIC_GITHUB_IO_CONTENTS_URL, PRERELEASE_COMMIT_HISTORY_FILE,
        PRERELEASE_TRACKING_FILE,
    },
    version,
};

/// `<base> ... <shorthash>`: the static-site repo's convention for a commit
/// that publishes a prerelease directory.
static ADD_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.\d+\.\d+)\s+(?:.*\s+)?([a-f0-9]{6,40})$").unwrap());

/// Any line that denotes deletion/removal of the same base+hash tuple, in
/// either `2.7.14 abc123` or `firmware-2.7.14.abc123` spelling.
static DELETE_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:deleted?|removed?)\b.*?(\d+\.\d+\.\d+)[.\s]+([a-fA-F0-9]{6,40})\b").unwrap()
});

static PRERELEASE_SUFFIX_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+\.\d+\.\d+\.[a-f0-9]{6,}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrereleaseStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrereleaseEntry {
    pub directory: String,
    pub identifier: String,
    pub base_version: String,
    pub commit_hash: String,
    pub added_at: Option<String>,
    pub removed_at: Option<String>,
    pub added_sha: Option<String>,
    pub removed_sha: Option<String>,
    pub active: bool,
    pub status: PrereleaseStatus,
}

impl PrereleaseEntry {
    fn new(directory: String, identifier: String, base_version: &str, commit_hash: String) -> Self {
        Self {
            directory,
            identifier,
            base_version: base_version.to_string(),
            commit_hash,
            added_at: None,
            removed_at: None,
            added_sha: None,
            removed_sha: None,
            active: true,
            status: PrereleaseStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrereleaseSummary {
    pub created: usize,
    pub deleted: usize,
    pub active: usize,
}

/// Reconstructs the lifecycle of firmware prereleases from the commit
/// messages of the static-site repository.
pub struct PrereleaseHistory<'a> {
    cache: &'a CacheStore,
}

impl<'a> PrereleaseHistory<'a> {
    pub fn new(cache: &'a CacheStore) -> Self {
        Self { cache }
    }

    /// Fetch recent commits, serving from the commits cache when fresh.
    /// API failures degrade to an empty list; the pipeline carries on.
    pub async fn fetch_recent_commits(
        &self,
        source: &GithubSource,
        max_commits: usize,
        force_refresh: bool,
    ) -> Vec<Commit> {
        let max_commits = max_commits.max(1);

        if force_refresh {
            self.cache.invalidate_commits_cache();
        } else if let Some(commits) = self.cache.read_commits_cache() {
            return commits.into_iter().take(max_commits).collect();
        }

        debug!("Fetching commits from API (cache miss/expired)");
        match source
            .list_commits(MESHTASTIC_GITHUB_IO_COMMITS_URL, max_commits)
            .await
        {
            Ok(commits) => {
                self.cache.write_commits_cache(&commits);
                commits
            }
            Err(err) => {
                warn!("Could not fetch repo commits: {err}");
                Vec::new()
            }
        }
    }

    /// Build the per-base-version event log, oldest commit first. Within a
    /// directory later events override earlier ones; the first observed
    /// add/delete timestamp sticks.
    pub fn build_history(
        &self,
        expected_version: &str,
        commits: &[Commit],
    ) -> (Vec<PrereleaseEntry>, BTreeSet<String>) {
        let mut entries: Vec<PrereleaseEntry> = Vec::new();
        let mut seen_shas = BTreeSet::new();

        // The API returns commits newest first; replay oldest to newest.
        for commit in commits.iter().rev() {
            if let Some(sha) = &commit.sha {
                seen_shas.insert(sha.clone());
            }

            for line in commit.message.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some(caps) = ADD_RX.captures(line) {
                    if &caps[1] != expected_version {
                        continue;
                    }
                    let identifier = format!("{}.{}", &caps[1], &caps[2]).to_lowercase();
                    let directory = format!("{FIRMWARE_DIR_PREFIX}{identifier}");
                    let entry = upsert(
                        &mut entries,
                        directory,
                        identifier,
                        expected_version,
                        caps[2].to_lowercase(),
                    );
                    if entry.added_at.is_none() {
                        entry.added_at = commit.date.clone();
                    }
                    if entry.added_sha.is_none() {
                        entry.added_sha = commit.sha.clone();
                    }
                    entry.active = true;
                    entry.status = PrereleaseStatus::Active;
                    entry.removed_at = None;
                    entry.removed_sha = None;
                    continue;
                }

                if let Some(caps) = DELETE_RX.captures(line) {
                    if &caps[1] != expected_version {
                        continue;
                    }
                    let identifier = format!("{}.{}", &caps[1], &caps[2]).to_lowercase();
                    let directory = format!("{FIRMWARE_DIR_PREFIX}{identifier}");
                    let entry = upsert(
                        &mut entries,
                        directory,
                        identifier,
                        expected_version,
                        caps[2].to_lowercase(),
                    );
                    if entry.removed_at.is_none() {
                        entry.removed_at = commit.date.clone();
                    }
                    if entry.removed_sha.is_none() {
                        entry.removed_sha = commit.sha.clone();
                    }
                    entry.active = false;
                    entry.status = PrereleaseStatus::Deleted;
                }
            }
        }

        entries.sort_by(|a, b| {
            (a.added_at.as_deref().unwrap_or(""), a.directory.as_str())
                .cmp(&(b.added_at.as_deref().unwrap_or(""), b.directory.as_str()))
        });
        (entries, seen_shas)
    }

    /// Simplified history for a base version, persisted per version in the
    /// history cache. When a rebuild yields identical entries only the
    /// `last_checked` stamp is refreshed, avoiding rewrite churn.
    pub async fn get_history(
        &self,
        source: &GithubSource,
        expected_version: &str,
        force_refresh: bool,
        max_commits: usize,
    ) -> Vec<PrereleaseEntry> {
        let history_file = self.cache.path(PRERELEASE_COMMIT_HISTORY_FILE);
        let now = Utc::now();

        let mut cache_doc = self
            .cache
            .read_json(&history_file)
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let cached_version = cache_doc.get(expected_version).cloned();
        let mut cache_was_stale = false;

        if !force_refresh {
            if let Some(cached) = cached_version.as_ref().and_then(Value::as_object) {
                let last_checked = cached
                    .get("last_checked")
                    .or_else(|| cached.get("cached_at"))
                    .and_then(Value::as_str)
                    .and_then(parse_iso_datetime_utc);
                if let (Some(last_checked), Some(entries)) =
                    (last_checked, cached.get("entries"))
                {
                    let age = now.signed_duration_since(last_checked);
                    if age < chrono::Duration::from_std(COMMITS_CACHE_TTL).unwrap() {
                        if let Ok(entries) =
                            serde_json::from_value::<Vec<PrereleaseEntry>>(entries.clone())
                        {
                            debug!(
                                "Using cached prerelease history for {expected_version} \
                                 (checked {}s ago)",
                                age.num_seconds()
                            );
                            return entries;
                        }
                    }
                    cache_was_stale = true;
                }
            }
        }

        let commits = self
            .fetch_recent_commits(source, max_commits, force_refresh)
            .await;
        let (entries, shas) = self.build_history(expected_version, &commits);

        let old_entries = cached_version
            .as_ref()
            .and_then(|v| v.get("entries"))
            .and_then(|v| serde_json::from_value::<Vec<PrereleaseEntry>>(v.clone()).ok());

        let now_iso = Utc::now().to_rfc3339();
        if old_entries.as_deref() == Some(entries.as_slice()) {
            if cache_was_stale {
                if let Some(Value::Object(mut old)) = cached_version {
                    debug!(
                        "Prerelease history unchanged for {expected_version}; \
                         refreshing last_checked"
                    );
                    old.insert("last_checked".into(), Value::String(now_iso));
                    old.insert(
                        "shas".into(),
                        serde_json::to_value(shas.iter().collect::<Vec<_>>()).unwrap_or_default(),
                    );
                    cache_doc.insert(expected_version.to_string(), Value::Object(old));
                    let _ = self
                        .cache
                        .atomic_write_json(&history_file, &Value::Object(cache_doc));
                }
            }
            return entries;
        }

        cache_doc.insert(
            expected_version.to_string(),
            json!({
                "entries": &entries,
                "cached_at": &now_iso,
                "last_checked": &now_iso,
                "shas": shas.iter().collect::<Vec<_>>(),
            }),
        );
        if self
            .cache
            .atomic_write_json(&history_file, &Value::Object(cache_doc))
            .is_ok()
        {
            debug!(
                "Saved {} prerelease history entries for {expected_version}",
                entries.len()
            );
        }
        entries
    }

    /// The newest active prerelease directory plus the full history for
    /// rendering.
    pub async fn latest_active_prerelease(
        &self,
        source: &GithubSource,
        expected_version: &str,
        force_refresh: bool,
        max_commits: usize,
    ) -> (Option<String>, Vec<PrereleaseEntry>) {
        let entries = self
            .get_history(source, expected_version, force_refresh, max_commits)
            .await;
        let latest = entries
            .iter()
            .filter(|e| e.status == PrereleaseStatus::Active && !e.directory.is_empty())
            .next_back()
            .map(|e| e.directory.clone());
        (latest, entries)
    }

    pub fn summarize(&self, entries: &[PrereleaseEntry]) -> PrereleaseSummary {
        PrereleaseSummary {
            created: entries
                .iter()
                .filter(|e| e.added_at.is_some() || e.added_sha.is_some())
                .count(),
            deleted: entries
                .iter()
                .filter(|e| e.status == PrereleaseStatus::Deleted || e.removed_at.is_some())
                .count(),
            active: entries
                .iter()
                .filter(|e| e.status == PrereleaseStatus::Active || e.active)
                .count(),
        }
    }

    /// Filter directory names to `firmware-<base>.<6+ hex>` suffixes for the
    /// expected base version. Returns suffixes without the prefix.
    pub fn scan_prerelease_directories(
        &self,
        directories: &[String],
        expected_version: &str,
    ) -> Vec<String> {
        directories
            .iter()
            .filter_map(|raw| raw.strip_prefix(FIRMWARE_DIR_PREFIX))
            .filter(|suffix| PRERELEASE_SUFFIX_RX.is_match(suffix))
            .filter(|suffix| {
                let parts: Vec<&str> = suffix.split('.').collect();
                parts.len() >= 4 && parts[..3].join(".") == expected_version
            })
            .map(str::to_string)
            .collect()
    }

    /// The newest prerelease directory present on the static site for this
    /// base version. Directories whose hash appears in the commit history
    /// outrank the rest; ties break deterministically by name.
    pub async fn find_latest_remote_dir(
        &self,
        source: &GithubSource,
        expected_version: &str,
        force_refresh: bool,
        max_commits: usize,
    ) -> Option<String> {
        let history = self
            .get_history(source, expected_version, force_refresh, max_commits)
            .await;

        let preferred_hashes: BTreeSet<String> = history
            .iter()
            .filter_map(|e| e.identifier.rsplit('.').next())
            .map(str::to_lowercase)
            .collect();

        let listing = match source.list_directory(MESHTASTIC_GITHUB_IO_CONTENTS_URL).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Could not list prerelease directories for {expected_version}: {err}");
                return None;
            }
        };
        let names: Vec<String> = listing.into_iter().map(|e| e.name).collect();

        let mut candidates = self.scan_prerelease_directories(&names, expected_version);
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by_key(|suffix| {
            let hash = suffix.rsplit('.').next().unwrap_or("").to_lowercase();
            (
                preferred_hashes.contains(&hash),
                version::release_tuple(suffix).unwrap_or_default(),
                suffix.clone(),
            )
        });
        candidates
            .pop()
            .map(|suffix| format!("{FIRMWARE_DIR_PREFIX}{suffix}"))
    }

    /// Maintain the legacy prerelease_tracking.json payload. Resets the
    /// tracked identifiers when the stable release changes; returns the
    /// number of identifiers recorded after the update.
    pub fn update_legacy_tracking(&self, latest_release_tag: &str, newest_dir: &str) -> usize {
        let Some(prerelease_id) = newest_dir.strip_prefix(FIRMWARE_DIR_PREFIX) else {
            return 0;
        };
        let prerelease_id = prerelease_id.to_lowercase();
        let clean_release = version::extract_clean_version(latest_release_tag);

        let tracking_file = self.cache.path(PRERELEASE_TRACKING_FILE);
        let tracking = self
            .cache
            .read_json(&tracking_file)
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let existing_release = tracking
            .get("version")
            .or_else(|| tracking.get("latest_version"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut existing_commits: Vec<String> = tracking
            .get("commits")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .or_else(|| {
                tracking
                    .get("hash")
                    .and_then(Value::as_str)
                    .map(|h| vec![h.to_string()])
            })
            .unwrap_or_default();

        if let (Some(existing), Some(clean)) = (&existing_release, &clean_release) {
            if existing != clean {
                info!(
                    "New release {latest_release_tag} detected (previously tracking \
                     {existing}). Resetting prerelease tracking."
                );
                existing_commits.clear();
            }
        }

        if existing_commits.iter().any(|c| c == &prerelease_id) {
            return existing_commits.len();
        }
        existing_commits.push(prerelease_id.clone());

        let now_iso = Utc::now().to_rfc3339();
        let short_hash = prerelease_id
            .rsplit('.')
            .next()
            .unwrap_or(&prerelease_id)
            .to_string();
        let payload = json!({
            "version": clean_release,
            "commits": existing_commits,
            "hash": short_hash,
            "count": existing_commits.len(),
            "timestamp": now_iso,
            "last_updated": now_iso,
        });

        if self.cache.atomic_write_json(&tracking_file, &payload).is_err() {
            return 0;
        }
        existing_commits.len()
    }
}

fn upsert<'e>(
    entries: &'e mut Vec<PrereleaseEntry>,
    directory: String,
    identifier: String,
    base_version: &str,
    commit_hash: String,
) -> &'e mut PrereleaseEntry {
    if let Some(index) = entries.iter().position(|e| e.directory == directory) {
        &mut entries[index]
    } else {
        entries.push(PrereleaseEntry::new(
            directory,
            identifier,
            base_version,
            commit_hash,
        ));
        entries.last_mut().expect("just pushed")
    }
}
