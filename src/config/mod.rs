use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Model-serving daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Daemon binary to spawn
    #[serde(default = "default_daemon_binary")]
    pub binary: String,
    /// Arguments for the serve invocation
    #[serde(default = "default_serve_args")]
    pub serve_args: Vec<String>,
    /// Base URL of the daemon's HTTP API
    #[serde(default = "default_daemon_url")]
    pub url: String,
    /// Whether stagehand owns the daemon lifecycle. When an external daemon
    /// already answers at `url`, stagehand attaches to it regardless.
    #[serde(default = "default_true")]
    pub managed: bool,
    /// Extra environment passed to the daemon child
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_daemon_binary(),
            serve_args: default_serve_args(),
            url: default_daemon_url(),
            managed: true,
            env: HashMap::new(),
        }
    }
}

fn default_daemon_binary() -> String {
    "ollama".to_string()
}

fn default_serve_args() -> Vec<String> {
    vec!["serve".to_string()]
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_true() -> bool {
    true
}

/// UI server settings
#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    /// UI command to spawn
    #[serde(default = "default_ui_command")]
    pub command: String,
    /// Base arguments; the server address flags are appended from the
    /// fields below
    #[serde(default = "default_ui_args")]
    pub args: Vec<String>,
    #[serde(default = "default_ui_host")]
    pub host: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Working directory for the UI child
    pub workdir: Option<PathBuf>,
    /// Extra environment passed to the UI child
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            command: default_ui_command(),
            args: default_ui_args(),
            host: default_ui_host(),
            port: default_ui_port(),
            headless: true,
            workdir: None,
            env: HashMap::new(),
        }
    }
}

impl UiConfig {
    /// Full argument vector for the UI child, server flags included
    pub fn server_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--server.address".to_string());
        args.push(self.host.clone());
        args.push("--server.port".to_string());
        args.push(self.port.to_string());
        args.push("--server.headless".to_string());
        args.push(self.headless.to_string());
        args
    }
}

fn default_ui_command() -> String {
    "streamlit".to_string()
}

fn default_ui_args() -> Vec<String> {
    vec!["run".to_string(), "app.py".to_string()]
}

fn default_ui_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ui_port() -> u16 {
    7860
}

/// Required model set and pull behavior
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Models that must be present before the UI starts
    #[serde(default = "default_required_models")]
    pub required: Vec<String>,
    /// Total pull attempts per model (default: 3)
    #[serde(default = "default_pull_retries")]
    pub pull_retries: u32,
    /// Upper bound for a single pull in seconds (default: 1800)
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            required: default_required_models(),
            pull_retries: default_pull_retries(),
            pull_timeout_secs: default_pull_timeout(),
        }
    }
}

fn default_required_models() -> Vec<String> {
    vec!["nomic-embed-text".to_string(), "mistral:7b".to_string()]
}

fn default_pull_retries() -> u32 {
    3
}

fn default_pull_timeout() -> u64 {
    1800
}

/// Daemon readiness probe settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    /// Seconds between probe attempts (default: 2)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Timeout for a single probe request in seconds (default: 5)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Overall deadline for the daemon to become ready in seconds (default: 120)
    #[serde(default = "default_deadline")]
    pub deadline_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            deadline_secs: default_deadline(),
        }
    }
}

fn default_probe_interval() -> u64 {
    2
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_deadline() -> u64 {
    120
}

/// Child supervision settings
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub restart: RestartConfig,
    /// Grace period between SIGTERM and SIGKILL when stopping a child (default: 10)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart: RestartConfig::default(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

fn default_stop_grace() -> u64 {
    10
}

/// Restart policy for crashed children
#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restart attempts before giving up (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff delay in seconds, doubled per attempt (default: 2)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    /// Backoff ceiling in seconds (default: 60)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// A child running this long is considered stable and its restart
    /// counter resets (default: 300)
    #[serde(default = "default_stable_secs")]
    pub stable_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            stable_secs: default_stable_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    60
}

fn default_stable_secs() -> u64 {
    300
}

/// Filesystem layout
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Application data directory, created at startup
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Model store directory, created at startup and handed to the daemon
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model_dir: default_model_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/app/db")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("/app/models")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration file")?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            ui: UiConfig::default(),
            models: ModelsConfig::default(),
            readiness: ReadinessConfig::default(),
            supervisor: SupervisorConfig::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Reject configurations the supervisor cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.ui.port == 0 {
            bail!("ui.port must be nonzero");
        }
        if self.ui.command.trim().is_empty() {
            bail!("ui.command must not be empty");
        }
        if self.daemon.binary.trim().is_empty() {
            bail!("daemon.binary must not be empty");
        }
        if self.models.required.iter().any(|m| m.trim().is_empty()) {
            bail!("models.required must not contain empty names");
        }
        if self.models.pull_retries == 0 {
            bail!("models.pull_retries must be at least 1");
        }
        if self.readiness.probe_interval_secs == 0 {
            bail!("readiness.probe_interval_secs must be nonzero");
        }
        if self.readiness.deadline_secs < self.readiness.probe_interval_secs {
            bail!("readiness.deadline_secs must be at least probe_interval_secs");
        }
        if self.supervisor.restart.max_backoff_secs < self.supervisor.restart.initial_backoff_secs {
            bail!("supervisor.restart.max_backoff_secs must be at least initial_backoff_secs");
        }
        Ok(())
    }
}
