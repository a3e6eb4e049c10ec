use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{error::DownloadError, http::HttpClient};

pub const GITHUB_MAX_PER_PAGE: usize = 100;

/// A release snapshot as seen during one run. Identity is `tag_name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub tag_name: String,
    pub prerelease: bool,
    pub published_at: Option<String>,
    pub name: Option<String>,
    pub body: Option<String>,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub name: String,
    pub download_url: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    pub sha: Option<String>,
    pub message: String,
    pub date: Option<String>,
}

/// An entry from the GitHub contents API.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub name: String,
    pub path: String,
    pub download_url: Option<String>,
    pub size: u64,
    pub is_file: bool,
}

/// Storage hook for the raw releases payload. The caller owns expiry policy;
/// a `read` miss means the source fetches fresh and calls `write`.
pub trait ReleaseCache {
    fn read(&self, key: &str) -> Option<Value>;
    fn write(&self, key: &str, data: &Value);
}

/// Deterministic cache key derived from the URL and its query parameters.
pub fn url_cache_key(url: &str, params: &[(&str, String)]) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    for (name, value) in sorted {
        hasher.update(b"&");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

pub struct GithubSource {
    http: HttpClient,
}

impl GithubSource {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Fetch the raw releases payload, serving from `cache` when it has a
    /// fresh copy. The payload is cached as-received; parsing always runs
    /// fresh so parser fixes apply to cached data too.
    pub async fn fetch_raw_releases(
        &self,
        url: &str,
        params: &[(&str, String)],
        cache: Option<&dyn ReleaseCache>,
    ) -> Result<Value, DownloadError> {
        let key = url_cache_key(url, params);

        if let Some(cache) = cache {
            if let Some(data) = cache.read(&key) {
                debug!("Using cached releases for {url}");
                return Ok(data);
            }
        }

        let data = self.http.get_json(url, params).await?;
        if !data.is_array() {
            return Err(DownloadError::MalformedResponse {
                url: url.to_string(),
                reason: "expected a release list".to_string(),
            });
        }

        if let Some(cache) = cache {
            cache.write(&key, &data);
        }

        Ok(data)
    }

    /// Fetch and parse releases, newest first as returned by the API.
    /// Malformed top-level entries and malformed assets are skipped with a
    /// warning; releases without a tag or without any valid asset are dropped.
    pub async fn get_releases(
        &self,
        url: &str,
        params: &[(&str, String)],
        cache: Option<&dyn ReleaseCache>,
    ) -> Result<Vec<Release>, DownloadError> {
        let raw = self.fetch_raw_releases(url, params, cache).await?;
        let entries = raw.as_array().cloned().unwrap_or_default();

        let mut releases = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(release) = parse_release(entry, url) {
                releases.push(release);
            }
        }

        debug!("Fetched {} releases from {url}", releases.len());
        Ok(releases)
    }

    /// Fetch recent commits, paginated, deduplicated by SHA. Stops at
    /// `max_commits` or when a short page signals the end of history.
    pub async fn list_commits(
        &self,
        url: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>, DownloadError> {
        let max_commits = max_commits.max(1);
        let per_page = max_commits.min(GITHUB_MAX_PER_PAGE);
        let mut commits = Vec::new();
        let mut seen_shas = std::collections::HashSet::new();
        let mut page = 1usize;

        while commits.len() < max_commits {
            let params = [
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ];
            let data = self.http.get_json(url, &params).await?;
            let Some(entries) = data.as_array() else {
                return Err(DownloadError::MalformedResponse {
                    url: url.to_string(),
                    reason: "expected a commit list".to_string(),
                });
            };
            if entries.is_empty() {
                break;
            }

            let page_len = entries.len();
            for entry in entries {
                let sha = entry.get("sha").and_then(Value::as_str).map(str::to_string);
                if let Some(ref sha) = sha {
                    if !seen_shas.insert(sha.clone()) {
                        continue;
                    }
                }
                let commit_info = entry.get("commit");
                let message = commit_info
                    .and_then(|c| c.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let date = commit_info
                    .and_then(|c| c.get("committer"))
                    .and_then(|c| c.get("date"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                commits.push(Commit { sha, message, date });
                if commits.len() >= max_commits {
                    break;
                }
            }

            if page_len < per_page {
                break;
            }
            page += 1;
        }

        Ok(commits)
    }

    /// List a directory through the GitHub contents API.
    pub async fn list_directory(&self, url: &str) -> Result<Vec<RepoEntry>, DownloadError> {
        let data = self.http.get_json(url, &[]).await?;
        let Some(entries) = data.as_array() else {
            return Err(DownloadError::MalformedResponse {
                url: url.to_string(),
                reason: "expected a directory listing".to_string(),
            });
        };

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?.to_string();
                Some(RepoEntry {
                    name,
                    path: entry
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    download_url: entry
                        .get("download_url")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
                    is_file: entry.get("type").and_then(Value::as_str) == Some("file"),
                })
            })
            .collect())
    }
}

fn parse_release(entry: &Value, url: &str) -> Option<Release> {
    let Some(obj) = entry.as_object() else {
        warn!("Skipping malformed release entry from {url}: not an object");
        return None;
    };

    let tag_name = match obj.get("tag_name").and_then(Value::as_str) {
        Some(tag) if !tag.trim().is_empty() => tag.to_string(),
        _ => {
            warn!("Skipping release with missing or invalid tag_name from {url}");
            return None;
        }
    };

    let Some(assets_data) = obj.get("assets").and_then(Value::as_array) else {
        warn!("Skipping release {tag_name} with invalid assets field");
        return None;
    };
    if assets_data.is_empty() {
        return None;
    }

    let mut assets = Vec::with_capacity(assets_data.len());
    for asset in assets_data {
        let Some(name) = asset.get("name").and_then(Value::as_str) else {
            warn!("Skipping malformed asset for release {tag_name}");
            continue;
        };
        if name.trim().is_empty() {
            warn!("Skipping asset with empty name for release {tag_name}");
            continue;
        }

        assets.push(Asset {
            name: name.to_string(),
            download_url: asset
                .get("browser_download_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            size: asset.get("size").and_then(Value::as_u64).unwrap_or(0),
            content_type: asset
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    if assets.is_empty() {
        warn!("Skipping release {tag_name} with no valid assets");
        return None;
    }

    Some(Release {
        tag_name,
        prerelease: obj.get("prerelease").and_then(Value::as_bool).unwrap_or(false),
        published_at: obj
            .get("published_at")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        body: obj.get("body").and_then(Value::as_str).map(str::to_string),
        assets,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<std::collections::HashMap<String, Value>>,
    }

    impl ReleaseCache for MemoryCache {
        fn read(&self, key: &str) -> Option<Value> {
            self.entries.lock().unwrap().get(key).cloned()
        }

        fn write(&self, key: &str, data: &Value) {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), data.clone());
        }
    }

    fn source() -> GithubSource {
        GithubSource::new(HttpClient::without_api_delay(None).unwrap())
    }

    #[test]
    fn cache_key_is_deterministic_and_param_order_independent() {
        let a = url_cache_key(
            "https://api.github.com/repos/x/y/releases",
            &[("per_page", "10".into()), ("page", "1".into())],
        );
        let b = url_cache_key(
            "https://api.github.com/repos/x/y/releases",
            &[("page", "1".into()), ("per_page", "10".into())],
        );
        assert_eq!(a, b);
        assert_ne!(a, url_cache_key("https://api.github.com/other", &[]));
    }

    #[test]
    fn parse_release_skips_malformed_entries() {
        assert!(parse_release(&json!("not an object"), "u").is_none());
        assert!(parse_release(&json!({"tag_name": "", "assets": []}), "u").is_none());
        assert!(parse_release(&json!({"tag_name": "v1.0.0", "assets": []}), "u").is_none());
        assert!(parse_release(&json!({"tag_name": "v1.0.0"}), "u").is_none());

        let release = parse_release(
            &json!({
                "tag_name": "v2.7.13",
                "prerelease": false,
                "published_at": "2025-06-01T00:00:00Z",
                "assets": [
                    {"name": "fw.zip", "size": 42, "browser_download_url": "https://dl/fw.zip"},
                    {"size": 7},
                    {"name": "odd-size.bin", "size": "huge"},
                ],
            }),
            "u",
        )
        .unwrap();
        assert_eq!(release.tag_name, "v2.7.13");
        assert_eq!(release.assets.len(), 2);
        assert_eq!(release.assets[0].size, 42);
        // Unparsable sizes coerce to 0 rather than dropping the asset.
        assert_eq!(release.assets[1].size, 0);
    }

    #[tokio::test]
    async fn releases_are_cached_raw_and_reparsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"tag_name": "v1.0.0", "assets": [{"name": "a.zip", "size": 1, "browser_download_url": "u"}]}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let source = source();
        let cache = MemoryCache::default();
        let url = format!("{}/releases", server.uri());

        let first = source.get_releases(&url, &[], Some(&cache)).await.unwrap();
        let second = source.get_releases(&url, &[], Some(&cache)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn empty_release_list_yields_no_releases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let source = source();
        let releases = source
            .get_releases(&format!("{}/releases", server.uri()), &[], None)
            .await
            .unwrap();
        assert!(releases.is_empty());
    }

    #[tokio::test]
    async fn commits_paginate_and_deduplicate() {
        let server = MockServer::start().await;
        let commit = |sha: &str, msg: &str| {
            json!({
                "sha": sha,
                "commit": {"message": msg, "committer": {"date": "2025-01-01T00:00:00Z"}}
            })
        };

        Mock::given(method("GET"))
            .and(path("/commits"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([commit("aaa", "first"), commit("bbb", "second")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/commits"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([commit("bbb", "second"), commit("ccc", "third")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/commits"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let source = source();
        let commits = source
            .list_commits(&format!("{}/commits", server.uri()), 2)
            .await
            .unwrap();
        let shas: Vec<_> = commits.iter().filter_map(|c| c.sha.as_deref()).collect();
        assert_eq!(shas, vec!["aaa", "bbb"]);
    }

    #[tokio::test]
    async fn directory_listing_parses_files_and_dirs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "firmware-2.7.14.abc123", "path": "firmware-2.7.14.abc123", "type": "dir"},
                {"name": "index.html", "path": "index.html", "type": "file", "size": 100,
                 "download_url": "https://meshtastic.github.io/index.html"},
            ])))
            .mount(&server)
            .await;

        let source = source();
        let entries = source
            .list_directory(&format!("{}/contents", server.uri()))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_file);
        assert!(entries[1].is_file);
        assert_eq!(entries[1].size, 100);
    }
}
