//! HTTP client for the model-serving daemon's API.
//!
//! Speaks the daemon's native endpoints:
//! - `GET /api/version` - daemon version, used as the readiness probe target
//! - `GET /api/tags` - installed models
//! - `POST /api/pull` - pull a model, streamed NDJSON progress
//!
//! The [`ModelStore`] trait is the seam the provisioner works against, so
//! provisioning logic can be tested without a live daemon.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from daemon API interactions
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("daemon returned an error: {message}")]
    Api { message: String },

    #[error("failed to decode daemon response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("pull of {model} did not complete within {seconds}s")]
    PullTimeout { model: String, seconds: u64 },
}

/// An installed model as reported by `/api/tags`
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// One NDJSON line of `/api/pull` progress
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Completion percentage when the layer size is known
    pub fn percent(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                Some(completed as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }
}

/// The model operations the provisioner needs from a daemon
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, DaemonError>;
    async fn pull_model(&self, name: &str) -> Result<(), DaemonError>;
}

pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
    pull_timeout: Duration,
}

impl DaemonClient {
    pub fn new(base_url: &str, pull_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("stagehand/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            pull_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Daemon version string
    pub async fn version(&self) -> Result<String, DaemonError> {
        let response = self.http.get(self.endpoint("/api/version")).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DaemonError::Api {
                message: format!("{}: {}", status, body),
            });
        }

        let version: VersionResponse = response.json().await?;
        Ok(version.version)
    }

    /// Quick liveness probe against the version endpoint
    pub async fn is_reachable(&self, timeout: Duration) -> bool {
        self.http
            .get(self.endpoint("/api/version"))
            .timeout(timeout)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    /// URL the readiness probe should poll
    pub fn probe_url(&self) -> String {
        self.endpoint("/api/version")
    }

    async fn pull_streaming(&self, name: &str) -> Result<(), DaemonError> {
        let response = self
            .http
            .post(self.endpoint("/api/pull"))
            .json(&serde_json::json!({ "model": name, "stream": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DaemonError::Api {
                message: format!("{}: {}", status, body),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut last_status = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                handle_progress_line(name, &line, &mut last_status)?;
            }
        }

        // The final line may arrive without a trailing newline
        if !buf.is_empty() {
            handle_progress_line(name, &buf, &mut last_status)?;
        }

        Ok(())
    }
}

fn handle_progress_line(
    model: &str,
    raw: &[u8],
    last_status: &mut String,
) -> Result<(), DaemonError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }

    let progress: PullProgress = serde_json::from_str(text)?;

    if let Some(message) = progress.error {
        return Err(DaemonError::Api { message });
    }

    if progress.status != *last_status {
        info!(model = %model, status = %progress.status, "Pull progress");
        *last_status = progress.status.clone();
    } else if let Some(percent) = progress.percent() {
        debug!(model = %model, percent = %format!("{:.0}%", percent), "Pull progress");
    }

    Ok(())
}

#[async_trait]
impl ModelStore for DaemonClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, DaemonError> {
        let response = self.http.get(self.endpoint("/api/tags")).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DaemonError::Api {
                message: format!("{}: {}", status, body),
            });
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models)
    }

    async fn pull_model(&self, name: &str) -> Result<(), DaemonError> {
        match tokio::time::timeout(self.pull_timeout, self.pull_streaming(name)).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::PullTimeout {
                model: name.to_string(),
                seconds: self.pull_timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = DaemonClient::new("http://127.0.0.1:11434/", Duration::from_secs(1));
        assert_eq!(client.endpoint("/api/tags"), "http://127.0.0.1:11434/api/tags");
        assert_eq!(client.probe_url(), "http://127.0.0.1:11434/api/version");
    }

    #[test]
    fn test_tags_response_parses_daemon_shape() {
        let json = r#"{
            "models": [
                {
                    "name": "mistral:7b",
                    "size": 4109865159,
                    "digest": "61e88e884507",
                    "modified_at": "2024-05-04T14:56:49.277302595-07:00"
                },
                { "name": "nomic-embed-text:latest" }
            ]
        }"#;
        let tags: TagsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[0].name, "mistral:7b");
        assert_eq!(tags.models[0].size, 4109865159);
        assert!(tags.models[0].modified_at.is_some());
        assert_eq!(tags.models[1].size, 0);
    }

    #[test]
    fn test_empty_tags_response() {
        let tags: TagsResponse = serde_json::from_str("{}").unwrap();
        assert!(tags.models.is_empty());
    }

    #[test]
    fn test_pull_progress_percent() {
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"pulling abc","total":200,"completed":50}"#).unwrap();
        assert_eq!(progress.percent(), Some(25.0));

        let no_total: PullProgress = serde_json::from_str(r#"{"status":"verifying"}"#).unwrap();
        assert_eq!(no_total.percent(), None);
    }

    #[test]
    fn test_progress_line_with_error_fails() {
        let mut last = String::new();
        let result = handle_progress_line("m", br#"{"error":"pull model manifest: not found"}"#, &mut last);
        assert!(matches!(result, Err(DaemonError::Api { .. })));
    }

    #[test]
    fn test_progress_line_blank_is_skipped() {
        let mut last = String::new();
        handle_progress_line("m", b"  \n", &mut last).unwrap();
        assert!(last.is_empty());
    }

    #[test]
    fn test_progress_line_tracks_status_transitions() {
        let mut last = String::new();
        handle_progress_line("m", br#"{"status":"pulling manifest"}"#, &mut last).unwrap();
        assert_eq!(last, "pulling manifest");
        handle_progress_line("m", br#"{"status":"success"}"#, &mut last).unwrap();
        assert_eq!(last, "success");
    }
}
