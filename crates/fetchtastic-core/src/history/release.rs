use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fetchtastic_dl::github::Release;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    cache::{parse_iso_datetime_utc, CacheStore},
    version,
};

static REVOKED_TITLE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\brevoked\b").unwrap());
static REVOKED_BODY_LINE_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(this release (has been|was|is) revoked|release (has been|was) revoked|revoked\b)")
        .unwrap()
});
static LEADING_NOISE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^a-zA-Z0-9]+").unwrap());
static ALPHA_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\balpha\b").unwrap());
static BETA_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bbeta\b").unwrap());
static RC_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(?:rc|release candidate)\b").unwrap());
static STABLE_RX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bstable\b").unwrap());
static HASH_TAGGED_RELEASE_RX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^v?\d+\.\d+\.\d+\.[a-f0-9]{6,}$").unwrap());

/// How many leading non-empty body lines the revocation heuristic inspects.
const REVOKED_BODY_LINE_BUDGET: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Alpha,
    Beta,
    Rc,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Alpha => write!(f, "alpha"),
            Channel::Beta => write!(f, "beta"),
            Channel::Rc => write!(f, "rc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Active,
    Revoked,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseHistoryEntry {
    pub tag_name: String,
    pub name: String,
    pub published_at: Option<String>,
    pub channel: Channel,
    pub base_version: String,
    pub status: ReleaseStatus,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<String>,
}

/// Channel detection is a pure function of `(name, tag_name)`; body text is
/// ignored so release notes cannot flip a channel. The upstream prerelease
/// flag is not consulted: it is noisy in this ecosystem.
pub fn detect_channel(release: &Release) -> Channel {
    let primary_text = [release.name.as_deref(), Some(release.tag_name.as_str())]
        .iter()
        .flatten()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if ALPHA_RX.is_match(&primary_text) {
        return Channel::Alpha;
    }
    if BETA_RX.is_match(&primary_text) {
        return Channel::Beta;
    }
    if RC_RX.is_match(&primary_text) {
        return Channel::Rc;
    }
    if STABLE_RX.is_match(&primary_text) {
        return Channel::Beta;
    }
    if HASH_TAGGED_RELEASE_RX.is_match(&release.tag_name) {
        return Channel::Alpha;
    }
    Channel::Alpha
}

/// A release is revoked when the title carries the word, or one of the first
/// non-empty body lines (quoting and leading punctuation stripped) states it.
/// `previously revoked` lines are explicitly skipped.
pub fn is_revoked(release: &Release) -> bool {
    if let Some(name) = &release.name {
        if REVOKED_TITLE_RX.is_match(name) {
            return true;
        }
    }

    let Some(body) = &release.body else {
        return false;
    };

    for line in body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(REVOKED_BODY_LINE_BUDGET)
    {
        let mut cleaned = line.trim();
        while let Some(rest) = cleaned.strip_prefix('>') {
            cleaned = rest.trim_start();
        }
        let cleaned = LEADING_NOISE_RX.replace(cleaned, "");
        if cleaned.is_empty() {
            continue;
        }
        if cleaned.to_lowercase().starts_with("previously revoked") {
            continue;
        }
        if REVOKED_BODY_LINE_RX.is_match(&cleaned) {
            return true;
        }
    }

    false
}

pub fn release_sort_key(release: &Release) -> (DateTime<Utc>, String) {
    (
        release
            .published_at
            .as_deref()
            .and_then(parse_iso_datetime_utc)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        release.tag_name.clone(),
    )
}

fn sorted_releases_newest_first(releases: &[Release]) -> Vec<&Release> {
    let mut sorted: Vec<&Release> = releases
        .iter()
        .filter(|r| !r.tag_name.is_empty())
        .collect();
    sorted.sort_by_key(|r| release_sort_key(r));
    sorted.reverse();
    sorted
}

/// Tracks active/revoked/removed status of releases across runs.
pub struct ReleaseHistory<'a> {
    cache: &'a CacheStore,
    history_file: std::path::PathBuf,
}

impl<'a> ReleaseHistory<'a> {
    pub fn new(cache: &'a CacheStore, file_name: &str) -> Self {
        let history_file = cache.path(file_name);
        Self {
            cache,
            history_file,
        }
    }

    pub fn load_entries(&self) -> BTreeMap<String, ReleaseHistoryEntry> {
        let Some(doc) = self.cache.read_json(&self.history_file) else {
            return BTreeMap::new();
        };
        let Some(entries) = doc.get("entries").and_then(Value::as_object) else {
            return BTreeMap::new();
        };

        entries
            .iter()
            .filter_map(|(tag, value)| {
                match serde_json::from_value::<ReleaseHistoryEntry>(value.clone()) {
                    Ok(entry) => Some((tag.clone(), entry)),
                    Err(err) => {
                        debug!("Dropping malformed history entry {tag}: {err}");
                        None
                    }
                }
            })
            .collect()
    }

    /// Merge the current release snapshot into the stored history. Status
    /// transitions: active and revoked flip from body inspection; entries missing from
    /// the snapshot become removed only when they are newer than the
    /// snapshot's oldest entry (otherwise they merely fell off the window).
    /// A removed release that reappears reverts to active.
    pub fn update(&self, releases: &[Release]) -> BTreeMap<String, ReleaseHistoryEntry> {
        let mut entries = self.load_entries();
        let now = Utc::now().to_rfc3339();

        let current_tags: std::collections::BTreeSet<&str> = releases
            .iter()
            .filter(|r| !r.tag_name.is_empty())
            .map(|r| r.tag_name.as_str())
            .collect();
        let oldest_published = releases
            .iter()
            .filter_map(|r| r.published_at.as_deref())
            .filter_map(parse_iso_datetime_utc)
            .min();

        for release in releases {
            if release.tag_name.is_empty() {
                continue;
            }
            let status = if is_revoked(release) {
                ReleaseStatus::Revoked
            } else {
                ReleaseStatus::Active
            };
            let channel = detect_channel(release);
            let base_version = version::extract_clean_version(&release.tag_name)
                .unwrap_or_else(|| release.tag_name.clone())
                .trim_start_matches(['v', 'V'])
                .to_string();

            let previous = entries.get(&release.tag_name);
            let first_seen = previous
                .map(|e| e.first_seen.clone())
                .unwrap_or_else(|| now.clone());
            let status_changed = previous.map(|e| e.status) != Some(status);
            let status_updated_at = if status_changed {
                Some(now.clone())
            } else {
                previous.and_then(|e| e.status_updated_at.clone())
            };

            entries.insert(
                release.tag_name.clone(),
                ReleaseHistoryEntry {
                    tag_name: release.tag_name.clone(),
                    name: release.name.clone().unwrap_or_default(),
                    published_at: release.published_at.clone(),
                    channel,
                    base_version,
                    status,
                    first_seen,
                    last_seen: now.clone(),
                    status_updated_at,
                    removed_at: None,
                },
            );
        }

        for (tag, entry) in entries.iter_mut() {
            if current_tags.contains(tag.as_str()) || entry.status == ReleaseStatus::Removed {
                continue;
            }
            let Some(oldest) = oldest_published else {
                continue;
            };
            let published = entry
                .published_at
                .as_deref()
                .and_then(parse_iso_datetime_utc);
            let Some(published) = published else { continue };
            if published < oldest {
                // Likely fell off the snapshot window, not removed upstream.
                continue;
            }
            entry.status = ReleaseStatus::Removed;
            entry.removed_at = Some(now.clone());
            entry.status_updated_at = Some(now.clone());
        }

        let doc = json!({
            "entries": &entries,
            "last_updated": now,
        });
        if self.cache.atomic_write_json(&self.history_file, &doc).is_err() {
            debug!(
                "Release history write failed for {}",
                self.history_file.display()
            );
        }
        entries
    }

    pub fn find_most_recent_beta<'r>(&self, releases: &'r [Release]) -> Option<&'r Release> {
        releases
            .iter()
            .filter(|r| detect_channel(r) == Channel::Beta)
            .max_by_key(|r| release_sort_key(r))
    }

    /// Grow `keep_limit` just enough that the most recent beta stays inside
    /// the retained window.
    pub fn expand_keep_limit_to_include_beta(
        &self,
        releases: &[Release],
        keep_limit: usize,
    ) -> usize {
        if keep_limit == 0 {
            return 0;
        }
        let Some(beta) = self.find_most_recent_beta(releases) else {
            return keep_limit;
        };

        let sorted = sorted_releases_newest_first(releases);
        match sorted.iter().position(|r| r.tag_name == beta.tag_name) {
            Some(index) if index >= keep_limit => (index + 1).min(sorted.len()),
            _ => keep_limit,
        }
    }

    pub fn log_status_summary(
        &self,
        entries: &BTreeMap<String, ReleaseHistoryEntry>,
        label: &str,
    ) {
        let revoked: Vec<&ReleaseHistoryEntry> = entries
            .values()
            .filter(|e| e.status == ReleaseStatus::Revoked)
            .collect();
        let removed: Vec<&ReleaseHistoryEntry> = entries
            .values()
            .filter(|e| e.status == ReleaseStatus::Removed)
            .collect();

        if revoked.is_empty() && removed.is_empty() {
            return;
        }

        info!(
            "{label} release status: {} revoked, {} removed",
            revoked.len(),
            removed.len()
        );
        for (heading, group) in [("revoked", revoked), ("removed", removed)] {
            if group.is_empty() {
                continue;
            }
            info!("{label} {heading} releases:");
            for entry in group {
                info!("  - {} ({}, {heading})", entry.tag_name, entry.channel);
            }
        }
    }

    pub fn log_channel_summary(&self, releases: &[Release], label: &str, keep_limit: usize) {
        if releases.is_empty() {
            return;
        }

        let sorted = sorted_releases_newest_first(releases);
        let kept = &sorted[..keep_limit.min(sorted.len())];
        let counted = if kept.is_empty() { &sorted[..] } else { kept };

        let mut counts: BTreeMap<Channel, Vec<&Release>> = BTreeMap::new();
        for release in counted.iter().copied() {
            counts.entry(detect_channel(release)).or_default().push(release);
        }

        let summary: Vec<String> = [Channel::Alpha, Channel::Beta, Channel::Rc]
            .iter()
            .filter_map(|channel| {
                counts
                    .get(channel)
                    .map(|list| format!("{channel}={}", list.len()))
            })
            .collect();
        if summary.is_empty() {
            return;
        }

        info!(
            "{label} release channels (keeping {} of {}): {}",
            kept.len(),
            sorted.len(),
            summary.join(", ")
        );
        for channel in [Channel::Alpha, Channel::Beta, Channel::Rc] {
            if let Some(list) = counts.get(&channel) {
                let items: Vec<String> = list
                    .iter()
                    .map(|r| {
                        if is_revoked(r) {
                            format!("{} (revoked)", r.tag_name)
                        } else {
                            r.tag_name.clone()
                        }
                    })
                    .collect();
                info!("  - {channel}: {}", items.join(", "));
            }
        }
    }

    pub fn log_duplicate_base_versions(&self, releases: &[Release], label: &str) {
        let mut base_map: BTreeMap<String, Vec<&Release>> = BTreeMap::new();
        for release in releases {
            if release.tag_name.is_empty() {
                continue;
            }
            let base = version::extract_clean_version(&release.tag_name)
                .unwrap_or_else(|| release.tag_name.clone())
                .trim_start_matches(['v', 'V'])
                .to_string();
            if base.is_empty() {
                continue;
            }
            base_map.entry(base).or_default().push(release);
        }

        for (base, grouped) in base_map {
            if grouped.len() < 2 {
                continue;
            }
            let items: Vec<&str> = grouped.iter().map(|r| r.tag_name.as_str()).collect();
            warn!(
                "{label}: multiple releases share base version {base}: {}",
                items.join(", ")
            );
        }
    }
}

// Channel needs Ord for BTreeMap keys in the summary.
impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(c: &Channel) -> u8 {
            match c {
                Channel::Alpha => 0,
                Channel::Beta => 1,
                Channel::Rc => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn release(tag: &str, name: Option<&str>, body: Option<&str>) -> Release {
        Release {
            tag_name: tag.to_string(),
            prerelease: false,
            published_at: Some("2025-06-01T00:00:00Z".to_string()),
            name: name.map(str::to_string),
            body: body.map(str::to_string),
            assets: Vec::new(),
        }
    }

    fn dated(tag: &str, published: &str) -> Release {
        Release {
            published_at: Some(published.to_string()),
            ..release(tag, None, None)
        }
    }

    #[test]
    fn channel_detection_reads_name_and_tag_only() {
        assert_eq!(
            detect_channel(&release("v2.7.13", Some("Meshtastic Firmware 2.7.13 Alpha"), None)),
            Channel::Alpha
        );
        assert_eq!(
            detect_channel(&release("v2.7.13-beta", None, None)),
            Channel::Beta
        );
        assert_eq!(
            detect_channel(&release("v2.7.13", Some("2.7.13 Release Candidate"), None)),
            Channel::Rc
        );
        // "stable" maps to beta.
        assert_eq!(
            detect_channel(&release("v2.7.13", Some("2.7.13 Stable"), None)),
            Channel::Beta
        );
        // Hash-suffixed tags default to alpha.
        assert_eq!(
            detect_channel(&release("v2.7.13.abcdef1", None, None)),
            Channel::Alpha
        );
        // Default is alpha.
        assert_eq!(detect_channel(&release("v2.7.13", None, None)), Channel::Alpha);
        // Body text never changes the channel.
        assert_eq!(
            detect_channel(&release("v2.7.13", None, Some("this is a beta build"))),
            Channel::Alpha
        );
    }

    #[test]
    fn revocation_detection_inspects_title_and_body_lines() {
        assert!(is_revoked(&release("v1", Some("2.7.13 (REVOKED)"), None)));
        assert!(is_revoked(&release(
            "v1",
            None,
            Some("This release has been revoked due to a bootloop.")
        )));
        assert!(is_revoked(&release("v1", None, Some("> **Revoked**"))));
        assert!(!is_revoked(&release("v1", None, Some("All good here"))));
        assert!(!is_revoked(&release("v1", None, None)));
        // The guard phrase is skipped.
        assert!(!is_revoked(&release(
            "v1",
            None,
            Some("Previously revoked builds are listed below.")
        )));
    }

    #[test]
    fn revocation_only_reads_the_first_fourteen_nonempty_lines() {
        let mut body = String::new();
        for i in 0..14 {
            body.push_str(&format!("line {i}\n\n"));
        }
        body.push_str("revoked\n");
        assert!(!is_revoked(&release("v1", None, Some(&body))));

        let mut body = String::new();
        for i in 0..13 {
            body.push_str(&format!("line {i}\n\n"));
        }
        body.push_str("revoked\n");
        assert!(is_revoked(&release("v1", None, Some(&body))));
    }

    #[test]
    fn update_tracks_revocation_and_removal() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::new(Some(dir.path().join("cache"))).unwrap();
        let history = ReleaseHistory::new(&cache, "release_history.json");

        let snapshot = vec![
            dated("v2.7.12", "2025-05-01T00:00:00Z"),
            dated("v2.7.13", "2025-06-01T00:00:00Z"),
        ];
        let entries = history.update(&snapshot);
        assert_eq!(entries.len(), 2);
        assert!(entries
            .values()
            .all(|e| e.status == ReleaseStatus::Active));

        // v2.7.13 disappears while being newer than the oldest listed
        // release: removed. v2.7.12 remains.
        let snapshot = vec![dated("v2.7.12", "2025-05-01T00:00:00Z")];
        let entries = history.update(&snapshot);
        assert_eq!(entries["v2.7.13"].status, ReleaseStatus::Removed);
        assert!(entries["v2.7.13"].removed_at.is_some());
        assert_eq!(entries["v2.7.12"].status, ReleaseStatus::Active);

        // Reappearance reverts to active and clears removed_at.
        let snapshot = vec![
            dated("v2.7.12", "2025-05-01T00:00:00Z"),
            dated("v2.7.13", "2025-06-01T00:00:00Z"),
        ];
        let entries = history.update(&snapshot);
        assert_eq!(entries["v2.7.13"].status, ReleaseStatus::Active);
        assert!(entries["v2.7.13"].removed_at.is_none());
    }

    #[test]
    fn releases_older_than_window_are_left_untouched() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::new(Some(dir.path().join("cache"))).unwrap();
        let history = ReleaseHistory::new(&cache, "release_history.json");

        history.update(&[
            dated("v2.7.10", "2025-03-01T00:00:00Z"),
            dated("v2.7.13", "2025-06-01T00:00:00Z"),
        ]);

        // v2.7.10 falls off a window whose oldest entry is newer than it.
        let entries = history.update(&[dated("v2.7.13", "2025-06-01T00:00:00Z")]);
        assert_eq!(entries["v2.7.10"].status, ReleaseStatus::Active);
    }

    #[test]
    fn first_seen_is_preserved_across_runs() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::new(Some(dir.path().join("cache"))).unwrap();
        let history = ReleaseHistory::new(&cache, "release_history.json");

        let first = history.update(&[dated("v2.7.13", "2025-06-01T00:00:00Z")]);
        let first_seen = first["v2.7.13"].first_seen.clone();
        let second = history.update(&[dated("v2.7.13", "2025-06-01T00:00:00Z")]);
        assert_eq!(second["v2.7.13"].first_seen, first_seen);
    }

    #[test]
    fn keep_limit_expands_to_cover_most_recent_beta() {
        let dir = tempdir().unwrap();
        let cache = CacheStore::new(Some(dir.path().join("cache"))).unwrap();
        let history = ReleaseHistory::new(&cache, "release_history.json");

        let releases = vec![
            dated("v2.7.15", "2025-06-05T00:00:00Z"),
            dated("v2.7.14", "2025-06-04T00:00:00Z"),
            Release {
                name: Some("2.7.12 Beta".to_string()),
                ..dated("v2.7.12", "2025-06-02T00:00:00Z")
            },
            dated("v2.7.11", "2025-06-01T00:00:00Z"),
        ];

        // Beta sits at index 2; a keep limit of 2 grows to 3.
        assert_eq!(history.expand_keep_limit_to_include_beta(&releases, 2), 3);
        // Already inside the window: unchanged.
        assert_eq!(history.expand_keep_limit_to_include_beta(&releases, 3), 3);
        // No beta at all: unchanged.
        let no_beta = vec![dated("v2.7.15", "2025-06-05T00:00:00Z")];
        assert_eq!(history.expand_keep_limit_to_include_beta(&no_beta, 2), 2);
        assert_eq!(history.expand_keep_limit_to_include_beta(&releases, 0), 0);
    }
}
