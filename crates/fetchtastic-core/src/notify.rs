use tracing::{debug, warn};

use crate::{config::Config, orchestrator::RunSummary};

/// Notification hook fired with the run summary. Enum dispatch keeps the
/// call site free of async-trait machinery.
pub enum Notifier {
    Ntfy(NtfyNotifier),
    Null,
}

impl Notifier {
    pub fn from_config(config: &Config) -> Self {
        match (&config.ntfy_server, &config.ntfy_topic) {
            (Some(server), Some(topic)) if !server.is_empty() && !topic.is_empty() => {
                Self::Ntfy(NtfyNotifier::new(
                    server.clone(),
                    topic.clone(),
                    config.notify_on_download_only,
                ))
            }
            _ => Self::Null,
        }
    }

    pub async fn notify(&self, summary: &RunSummary) {
        match self {
            Self::Ntfy(ntfy) => ntfy.send(summary).await,
            Self::Null => {}
        }
    }
}

pub struct NtfyNotifier {
    client: reqwest::Client,
    server: String,
    topic: String,
    downloads_only: bool,
}

impl NtfyNotifier {
    pub fn new(server: String, topic: String, downloads_only: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
            topic,
            downloads_only,
        }
    }

    async fn send(&self, summary: &RunSummary) {
        if self.downloads_only && summary.downloaded == 0 {
            debug!("Skipping notification: no new downloads");
            return;
        }

        let mut body = format!(
            "Downloaded {} files, {} up to date, {} failed.",
            summary.downloaded, summary.skipped, summary.failed
        );
        if !summary.new_version_tags.is_empty() {
            body.push_str(&format!(
                "\nNew versions: {}",
                summary.new_version_tags.join(", ")
            ));
        }
        for failure in &summary.failures {
            body.push_str(&format!(
                "\n{} {} failed: {}",
                failure.kind,
                failure.release_tag.as_deref().unwrap_or("<unknown>"),
                failure.error.as_deref().unwrap_or("unknown error")
            ));
        }

        let url = format!("{}/{}", self.server, self.topic);
        let result = self
            .client
            .post(&url)
            .header("Title", "Fetchtastic")
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Notification sent to {url}");
            }
            Ok(response) => {
                warn!("Notification to {url} returned HTTP {}", response.status());
            }
            Err(err) => {
                warn!("Could not send notification to {url}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn summary(downloaded: usize) -> RunSummary {
        RunSummary {
            downloaded,
            skipped: 2,
            failed: 0,
            new_version_tags: vec!["v2.7.13".to_string()],
            elapsed: std::time::Duration::from_secs(1),
            failures: Vec::new(),
        }
    }

    #[test]
    fn notifier_requires_server_and_topic() {
        let config = Config::default();
        assert!(matches!(Notifier::from_config(&config), Notifier::Null));

        let config = Config {
            ntfy_server: Some("https://ntfy.sh".to_string()),
            ntfy_topic: Some("fetchtastic-updates".to_string()),
            ..Config::default()
        };
        assert!(matches!(Notifier::from_config(&config), Notifier::Ntfy(_)));
    }

    #[tokio::test]
    async fn notification_posts_summary_to_topic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fetchtastic-updates"))
            .and(body_string_contains("Downloaded 3 files"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = NtfyNotifier::new(server.uri(), "fetchtastic-updates".to_string(), false);
        notifier.send(&summary(3)).await;
    }

    #[tokio::test]
    async fn downloads_only_filter_suppresses_empty_runs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let notifier = NtfyNotifier::new(server.uri(), "fetchtastic-updates".to_string(), true);
        notifier.send(&summary(0)).await;
    }
}
