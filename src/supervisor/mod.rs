//! Supervisor orchestration.
//!
//! Startup order, replacing the shell entrypoint:
//! 1. Preflight self-checks
//! 2. Attach to an already-running model daemon, or spawn one
//! 3. Wait for the daemon's API to answer (no fixed sleeps)
//! 4. Ensure required models are present
//! 5. Spawn the UI server
//! 6. Supervise both children: restart crashes with exponential backoff,
//!    stop everything in reverse order on SIGINT/SIGTERM
//!
//! Models are always provisioned before the UI child is spawned.

use crate::config::{Config, RestartConfig};
use crate::daemon::DaemonClient;
use crate::process::{format_exit, ManagedProcess, ProcessSpec};
use crate::provision;
use crate::readiness::{self, ProbeConfig};
use crate::startup;
use crate::utils::ensure_dir;
use anyhow::{bail, Context, Result};
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{error, info, warn};

/// Tracks restart attempts and backoff for a single managed child
#[derive(Debug, Clone)]
struct RestartState {
    attempts: u32,
    backoff: Duration,
    initial: Duration,
    max: Duration,
    stable: Duration,
}

impl RestartState {
    fn new(config: &RestartConfig) -> Self {
        let initial = Duration::from_secs(config.initial_backoff_secs);
        Self {
            attempts: 0,
            backoff: initial,
            initial,
            max: Duration::from_secs(config.max_backoff_secs),
            stable: Duration::from_secs(config.stable_secs),
        }
    }

    /// A child that ran long enough before exiting earns a fresh counter
    fn note_uptime(&mut self, uptime: Duration) {
        if uptime >= self.stable && self.attempts > 0 {
            self.attempts = 0;
            self.backoff = self.initial;
        }
    }

    fn exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Record an attempt and return the delay to wait before it
    fn next_delay(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.max);
        self.attempts += 1;
        delay
    }
}

pub struct Supervisor {
    config: Config,
    client: DaemonClient,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let client = DaemonClient::new(
            &config.daemon.url,
            Duration::from_secs(config.models.pull_timeout_secs),
        );
        let http = reqwest::Client::builder().build().unwrap_or_default();
        Self {
            config,
            client,
            http,
        }
    }

    /// Run the full startup sequence, then supervise until shutdown
    pub async fn run(self, skip_checks: bool) -> Result<()> {
        if skip_checks {
            warn!("Startup self-checks skipped");
            // The checks normally create these
            ensure_dir(&self.config.paths.data_dir)?;
            ensure_dir(&self.config.paths.model_dir)?;
        } else {
            let report = startup::run_startup_checks(&self.config);
            if !report.all_critical_passed {
                bail!("Startup checks failed: {}", report.summary);
            }
        }

        let daemon = self.start_daemon().await?;

        let probe = ProbeConfig::from_settings(self.client.probe_url(), &self.config.readiness);
        readiness::wait_ready(&self.http, &probe)
            .await
            .context("Model daemon failed to become ready")?;

        match self.client.version().await {
            Ok(version) => info!(version = %version, "Model daemon ready"),
            Err(e) => warn!(error = %e, "Daemon ready but version query failed"),
        }

        let report = provision::ensure_models(&self.client, &self.config.models).await?;
        info!(
            present = report.present.len(),
            pulled = report.pulled.len(),
            "Model provisioning complete"
        );

        let ui = ManagedProcess::spawn(&ui_spec(&self.config))?;
        info!(
            host = %self.config.ui.host,
            port = self.config.ui.port,
            "UI server starting"
        );

        self.supervise(daemon, ui).await
    }

    /// Attach to an external daemon when one already answers, else spawn our own
    async fn start_daemon(&self) -> Result<Option<ManagedProcess>> {
        if self.client.is_reachable(Duration::from_secs(2)).await {
            info!(url = %self.config.daemon.url, "Model daemon already reachable, attaching");
            return Ok(None);
        }

        if !self.config.daemon.managed {
            bail!(
                "daemon.managed is false and {} is not reachable",
                self.config.daemon.url
            );
        }

        Ok(Some(ManagedProcess::spawn(&daemon_spec(&self.config))?))
    }

    async fn supervise(
        &self,
        mut daemon: Option<ManagedProcess>,
        mut ui: ManagedProcess,
    ) -> Result<()> {
        let restart = self.config.supervisor.restart.clone();
        let grace = Duration::from_secs(self.config.supervisor.stop_grace_secs);
        let mut daemon_state = RestartState::new(&restart);
        let mut ui_state = RestartState::new(&restart);
        let mut shutdown = std::pin::pin!(shutdown_signal());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping children");
                    ui.stop(grace).await?;
                    if let Some(child) = daemon.as_mut() {
                        child.stop(grace).await?;
                    }
                    info!("Shutdown complete");
                    return Ok(());
                }
                status = ui.wait() => {
                    let status = status?;
                    ui_state.note_uptime(ui.uptime());
                    let desc = format_exit(&status);

                    if !restart.enabled || ui_state.exhausted(restart.max_attempts) {
                        error!(child = "ui", status = %desc, "UI server exited, giving up");
                        if let Some(child) = daemon.as_mut() {
                            child.stop(grace).await?;
                        }
                        bail!("UI server {}", desc);
                    }

                    let delay = ui_state.next_delay();
                    warn!(
                        child = "ui",
                        status = %desc,
                        attempt = ui_state.attempts,
                        max_attempts = restart.max_attempts,
                        delay_secs = delay.as_secs(),
                        "UI server exited, restarting after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    ui = ManagedProcess::spawn(&ui_spec(&self.config))?;
                }
                status = wait_child(daemon.as_mut()), if daemon.is_some() => {
                    let status = status?;
                    if let Some(child) = daemon.as_ref() {
                        daemon_state.note_uptime(child.uptime());
                    }
                    let desc = format_exit(&status);

                    if !restart.enabled || daemon_state.exhausted(restart.max_attempts) {
                        error!(child = "daemon", status = %desc, "Model daemon exited, giving up");
                        ui.stop(grace).await?;
                        bail!("Model daemon {}", desc);
                    }

                    let delay = daemon_state.next_delay();
                    warn!(
                        child = "daemon",
                        status = %desc,
                        attempt = daemon_state.attempts,
                        max_attempts = restart.max_attempts,
                        delay_secs = delay.as_secs(),
                        "Model daemon exited, restarting after backoff"
                    );
                    tokio::time::sleep(delay).await;

                    let child = ManagedProcess::spawn(&daemon_spec(&self.config))?;
                    let probe =
                        ProbeConfig::from_settings(self.client.probe_url(), &self.config.readiness);
                    if let Err(e) = readiness::wait_ready(&self.http, &probe).await {
                        error!(error = %e, "Restarted daemon did not become ready");
                        ui.stop(grace).await?;
                        bail!("Model daemon failed to become ready after restart");
                    }
                    daemon = Some(child);
                }
            }
        }
    }
}

/// Wait on an optional child; pending when absent (the select arm is
/// guarded on `is_some`, this keeps the future total)
async fn wait_child(child: Option<&mut ManagedProcess>) -> Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Child spec for the model daemon
pub fn daemon_spec(config: &Config) -> ProcessSpec {
    let mut env = config.daemon.env.clone();
    // The stock daemon reads its store location from OLLAMA_MODELS;
    // an explicit daemon.env entry wins
    env.entry("OLLAMA_MODELS".to_string())
        .or_insert_with(|| config.paths.model_dir.display().to_string());

    ProcessSpec {
        name: "daemon".to_string(),
        program: config.daemon.binary.clone(),
        args: config.daemon.serve_args.clone(),
        env,
        workdir: None,
    }
}

/// Child spec for the UI server
pub fn ui_spec(config: &Config) -> ProcessSpec {
    ProcessSpec {
        name: "ui".to_string(),
        program: config.ui.command.clone(),
        args: config.ui.server_args(),
        env: config.ui.env.clone(),
        workdir: config.ui.workdir.clone(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart_config() -> RestartConfig {
        RestartConfig {
            enabled: true,
            max_attempts: 5,
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
            stable_secs: 300,
        }
    }

    #[test]
    fn test_restart_state_exponential_backoff() {
        let mut state = RestartState::new(&restart_config());

        assert_eq!(state.next_delay(), Duration::from_secs(2));
        assert_eq!(state.next_delay(), Duration::from_secs(4));
        assert_eq!(state.next_delay(), Duration::from_secs(8));
        assert_eq!(state.next_delay(), Duration::from_secs(16));
        assert_eq!(state.next_delay(), Duration::from_secs(32));
        // Capped at max from here on
        assert_eq!(state.next_delay(), Duration::from_secs(60));
        assert_eq!(state.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_restart_state_exhaustion() {
        let mut state = RestartState::new(&restart_config());
        assert!(!state.exhausted(5));
        for _ in 0..5 {
            state.next_delay();
        }
        assert!(state.exhausted(5));
    }

    #[test]
    fn test_restart_state_stable_uptime_resets() {
        let mut state = RestartState::new(&restart_config());
        state.next_delay();
        state.next_delay();
        assert_eq!(state.attempts, 2);

        // Short uptime keeps the counter
        state.note_uptime(Duration::from_secs(10));
        assert_eq!(state.attempts, 2);

        // Stable uptime resets it
        state.note_uptime(Duration::from_secs(301));
        assert_eq!(state.attempts, 0);
        assert_eq!(state.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_daemon_spec_points_at_model_store() {
        let config = Config::default();
        let spec = daemon_spec(&config);
        assert_eq!(spec.program, "ollama");
        assert_eq!(spec.args, vec!["serve"]);
        assert_eq!(
            spec.env.get("OLLAMA_MODELS").map(String::as_str),
            Some("/app/models")
        );
    }

    #[test]
    fn test_daemon_spec_explicit_env_wins() {
        let mut config = Config::default();
        config
            .daemon
            .env
            .insert("OLLAMA_MODELS".to_string(), "/srv/models".to_string());
        let spec = daemon_spec(&config);
        assert_eq!(
            spec.env.get("OLLAMA_MODELS").map(String::as_str),
            Some("/srv/models")
        );
    }

    #[test]
    fn test_ui_spec_carries_server_flags() {
        let config = Config::default();
        let spec = ui_spec(&config);
        assert_eq!(spec.program, "streamlit");
        let rendered = spec.args.join(" ");
        assert!(rendered.starts_with("run app.py"));
        assert!(rendered.contains("--server.address 0.0.0.0"));
        assert!(rendered.contains("--server.port 7860"));
        assert!(rendered.contains("--server.headless true"));
    }
}
