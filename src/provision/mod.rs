//! Idempotent model provisioning.
//!
//! Before the UI server starts, every required model must be present in the
//! daemon's store. Models already installed are left alone; missing ones are
//! pulled with per-model retries. Any required model that cannot be
//! provisioned fails startup.

use crate::config::ModelsConfig;
use crate::daemon::{DaemonError, ModelStore};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of a provisioning run
#[derive(Debug, Default)]
pub struct ProvisionReport {
    /// Required models that were already installed
    pub present: Vec<String>,
    /// Required models pulled during this run
    pub pulled: Vec<String>,
    /// Required models that could not be provisioned, with the last error
    pub failed: Vec<(String, String)>,
}

/// Model name without its tag
pub fn base_name(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

/// Whether an installed model satisfies a required name.
///
/// A bare required name matches any installed tag of the same base, and
/// `name:latest` is interchangeable with `name`. A required name with any
/// other explicit tag must match exactly.
pub fn model_matches(required: &str, installed: &str) -> bool {
    if required == installed {
        return true;
    }
    match required.split_once(':') {
        None => base_name(installed) == required,
        Some((base, "latest")) => installed == base,
        Some(_) => false,
    }
}

/// Required models with no installed counterpart
pub fn missing_models<'a>(required: &'a [String], installed: &[String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|name| !installed.iter().any(|have| model_matches(name, have)))
        .map(|name| name.as_str())
        .collect()
}

/// Ensure every required model is present, pulling what is missing.
///
/// Returns the report on success; errors if any required model could not be
/// provisioned after retries.
pub async fn ensure_models(
    store: &dyn ModelStore,
    config: &ModelsConfig,
) -> Result<ProvisionReport> {
    let installed: Vec<String> = store
        .list_models()
        .await
        .context("Failed to list installed models")?
        .into_iter()
        .map(|model| model.name)
        .collect();

    let missing = missing_models(&config.required, &installed);
    let mut report = ProvisionReport::default();

    for name in &config.required {
        if !missing.contains(&name.as_str()) {
            info!(model = %name, "Model already present");
            report.present.push(name.clone());
        }
    }

    for name in missing {
        info!(model = %name, "Model missing, pulling");
        match pull_with_retries(store, name, config.pull_retries).await {
            Ok(()) => {
                info!(model = %name, "Model pulled");
                report.pulled.push(name.to_string());
            }
            Err(e) => {
                report.failed.push((name.to_string(), e.to_string()));
            }
        }
    }

    if !report.failed.is_empty() {
        for (name, err) in &report.failed {
            error!(model = %name, error = %err, "Model provisioning failed");
        }
        bail!(
            "{} required model(s) could not be provisioned",
            report.failed.len()
        );
    }

    Ok(report)
}

async fn pull_with_retries(
    store: &dyn ModelStore,
    name: &str,
    attempts: u32,
) -> Result<(), DaemonError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.pull_model(name).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                let delay = Duration::from_secs(2u64.saturating_pow(attempt).min(30));
                warn!(
                    model = %name,
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Model pull failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::ModelInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeStore {
        installed: Vec<String>,
        pulls: Mutex<Vec<String>>,
        /// Pull failures remaining per call before success
        fail_first: Mutex<u32>,
    }

    impl FakeStore {
        fn new(installed: &[&str]) -> Self {
            Self {
                installed: installed.iter().map(|s| s.to_string()).collect(),
                pulls: Mutex::new(Vec::new()),
                fail_first: Mutex::new(0),
            }
        }

        fn failing(installed: &[&str], failures: u32) -> Self {
            let store = Self::new(installed);
            *store.fail_first.lock().unwrap() = failures;
            store
        }
    }

    #[async_trait]
    impl ModelStore for FakeStore {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, DaemonError> {
            Ok(self
                .installed
                .iter()
                .map(|name| ModelInfo {
                    name: name.clone(),
                    size: 0,
                    digest: String::new(),
                    modified_at: None,
                })
                .collect())
        }

        async fn pull_model(&self, name: &str) -> Result<(), DaemonError> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DaemonError::Api {
                    message: "connection reset".to_string(),
                });
            }
            self.pulls.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("mistral:7b"), "mistral");
        assert_eq!(base_name("nomic-embed-text"), "nomic-embed-text");
    }

    #[test]
    fn test_model_matches_exact() {
        assert!(model_matches("mistral:7b", "mistral:7b"));
        assert!(!model_matches("mistral:7b", "mistral:instruct"));
    }

    #[test]
    fn test_model_matches_bare_required_any_tag() {
        assert!(model_matches("nomic-embed-text", "nomic-embed-text:latest"));
        assert!(model_matches("nomic-embed-text", "nomic-embed-text:v1.5"));
        assert!(!model_matches("nomic-embed-text", "nomic-embed-text-v2:latest"));
    }

    #[test]
    fn test_model_matches_latest_interchangeable() {
        assert!(model_matches("mistral:latest", "mistral"));
        assert!(model_matches("mistral", "mistral:latest"));
        assert!(!model_matches("mistral:7b", "mistral"));
    }

    #[test]
    fn test_missing_models() {
        let required = vec!["nomic-embed-text".to_string(), "mistral:7b".to_string()];
        let installed = vec!["nomic-embed-text:latest".to_string()];
        assert_eq!(missing_models(&required, &installed), vec!["mistral:7b"]);

        let all = vec![
            "nomic-embed-text:latest".to_string(),
            "mistral:7b".to_string(),
        ];
        assert!(missing_models(&required, &all).is_empty());
    }

    fn models_config(required: &[&str]) -> ModelsConfig {
        ModelsConfig {
            required: required.iter().map(|s| s.to_string()).collect(),
            pull_retries: 3,
            pull_timeout_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_ensure_models_skips_installed() {
        let store = FakeStore::new(&["mistral:7b", "nomic-embed-text:latest"]);
        let report = ensure_models(&store, &models_config(&["nomic-embed-text", "mistral:7b"]))
            .await
            .unwrap();
        assert_eq!(report.present.len(), 2);
        assert!(report.pulled.is_empty());
        assert!(store.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_models_pulls_missing() {
        let store = FakeStore::new(&["nomic-embed-text:latest"]);
        let report = ensure_models(&store, &models_config(&["nomic-embed-text", "mistral:7b"]))
            .await
            .unwrap();
        assert_eq!(report.present, vec!["nomic-embed-text".to_string()]);
        assert_eq!(report.pulled, vec!["mistral:7b".to_string()]);
        assert_eq!(*store.pulls.lock().unwrap(), vec!["mistral:7b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_models_retries_then_succeeds() {
        let store = FakeStore::failing(&[], 2);
        let report = ensure_models(&store, &models_config(&["mistral:7b"]))
            .await
            .unwrap();
        assert_eq!(report.pulled, vec!["mistral:7b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_models_fails_after_exhausting_retries() {
        let store = FakeStore::failing(&[], 10);
        let result = ensure_models(&store, &models_config(&["mistral:7b"])).await;
        assert!(result.is_err());
    }
}
