//! Readiness probing.
//!
//! Polls an HTTP endpoint until it answers 2xx or an overall deadline
//! elapses. Used to gate model provisioning and the UI launch on the
//! daemon actually accepting requests, instead of a fixed startup delay.

use crate::config::ReadinessConfig;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub deadline: Duration,
}

impl ProbeConfig {
    pub fn from_settings(url: String, settings: &ReadinessConfig) -> Self {
        Self {
            url,
            interval: Duration::from_secs(settings.probe_interval_secs),
            timeout: Duration::from_secs(settings.probe_timeout_secs),
            deadline: Duration::from_secs(settings.deadline_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("{url} not ready after {elapsed:?} (deadline {deadline:?}); last error: {last_error}")]
    DeadlineExceeded {
        url: String,
        elapsed: Duration,
        deadline: Duration,
        last_error: String,
    },
}

/// Poll `probe.url` until it answers 2xx. Returns the elapsed wait on
/// success; fails once the next attempt would overrun the deadline.
pub async fn wait_ready(
    http: &reqwest::Client,
    probe: &ProbeConfig,
) -> Result<Duration, ReadinessError> {
    let started = Instant::now();
    let mut last_error = String::from("no attempt completed");

    loop {
        match http.get(&probe.url).timeout(probe.timeout).send().await {
            Ok(response) if response.status().is_success() => {
                let elapsed = started.elapsed();
                info!(
                    url = %probe.url,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Endpoint ready"
                );
                return Ok(elapsed);
            }
            Ok(response) => {
                last_error = format!("HTTP {}", response.status());
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }

        if started.elapsed() + probe.interval >= probe.deadline {
            return Err(ReadinessError::DeadlineExceeded {
                url: probe.url.clone(),
                elapsed: started.elapsed(),
                deadline: probe.deadline,
                last_error,
            });
        }

        debug!(url = %probe.url, last_error = %last_error, "Waiting for readiness");
        tokio::time::sleep(probe.interval).await;
    }
}

/// TCP connect probe, used to see whether a server has bound its port
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering every connection with the given status line
    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let response =
                    format!("{}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    fn fast_probe(url: String) -> ProbeConfig {
        ProbeConfig {
            url,
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
            deadline: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_wait_ready_succeeds_on_200() {
        let url = serve_once("HTTP/1.1 200 OK").await;
        let http = reqwest::Client::new();
        let elapsed = wait_ready(&http, &fast_probe(url)).await.unwrap();
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_ready_rejects_server_error() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let http = reqwest::Client::new();
        let result = wait_ready(&http, &fast_probe(url)).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_wait_ready_deadline_on_refused_connection() {
        // Bind then drop to get a port nothing is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let http = reqwest::Client::new();
        let result = wait_ready(&http, &fast_probe(format!("http://{}/", addr))).await;
        assert!(matches!(
            result,
            Err(ReadinessError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_port_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open("127.0.0.1", port, Duration::from_millis(200)).await);

        drop(listener);
        // Transient, but a just-released port refuses immediately
        assert!(!port_open("127.0.0.1", port, Duration::from_millis(200)).await);
    }
}
