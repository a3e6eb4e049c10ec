use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::{debug, trace};

use crate::error::DownloadError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Politeness delay inserted before every outbound API call.
pub const API_CALL_DELAY: Duration = Duration::from_millis(100);

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Shared HTTP client for GitHub API calls and asset downloads. The
/// Authorization header is only attached to API requests; asset downloads go
/// through public redirect URLs where it must not leak.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    token: Option<String>,
    api_delay: Duration,
}

impl HttpClient {
    pub fn new(token: Option<String>) -> Result<Self, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );

        let client = reqwest::Client::builder()
            .user_agent(concat!("fetchtastic/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            token,
            api_delay: API_CALL_DELAY,
        })
    }

    /// A client with the politeness delay disabled; test servers do not need
    /// to be treated gently.
    pub fn without_api_delay(token: Option<String>) -> Result<Self, DownloadError> {
        let mut client = Self::new(token)?;
        client.api_delay = Duration::ZERO;
        Ok(client)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Issue an authenticated GitHub API GET. Maps rate-limit exhaustion to a
    /// retryable error carrying the reset time, 5xx to retryable status
    /// errors, and other 4xx to fatal status errors.
    pub async fn get_api(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, DownloadError> {
        if !self.api_delay.is_zero() {
            tokio::time::sleep(self.api_delay).await;
        }

        debug!("GET {url}");
        let mut request = self.client.get(url);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        trace!(status = status.as_u16(), url, "API response");

        if status.as_u16() == 403 && rate_limit_exhausted(&response) {
            let reset_at = rate_limit_reset(&response).unwrap_or_else(Utc::now);
            return Err(DownloadError::RateLimit { reset_at });
        }

        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response)
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, DownloadError> {
        let response = self.get_api(url, params).await?;
        response
            .json()
            .await
            .map_err(|err| DownloadError::MalformedResponse {
                url: url.to_string(),
                reason: err.to_string(),
            })
    }
}

fn rate_limit_exhausted(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        == Some(0)
}

fn rate_limit_reset(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let epoch = response
        .headers()
        .get("X-RateLimit-Reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())?;
    Utc.timestamp_opt(epoch, 0).single()
}
