//! Startup self-checks module
//!
//! Verifies the environment before any child is spawned:
//! - Daemon binary resolvable on PATH (when stagehand manages the daemon)
//! - UI command resolvable on PATH
//! - Data and model directories exist (created if missing) and are writable
//! - Sufficient disk space for the model store
//! - UI port not already bound

use serde::Serialize;
use std::net::TcpListener;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::utils::{ensure_dir, resolve_program, DiskStats};

/// Minimum free space for the model store (1 GiB)
const MIN_DISK_SPACE_BYTES: u64 = 1024 * 1024 * 1024;

/// Result of a single startup check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Whether a failure should abort startup
    pub critical: bool,
    /// Human-readable message describing the result
    pub message: String,
    /// Additional details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Aggregated startup check results
#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);

        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();
        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} non-critical warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

/// Run all startup self-checks
pub fn run_startup_checks(config: &Config) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let mut checks = Vec::new();

    checks.push(check_daemon_binary(config));
    checks.push(check_ui_command(config));
    checks.push(check_directory(&config.paths.data_dir, "data_dir"));
    checks.push(check_directory(&config.paths.model_dir, "model_dir"));
    checks.push(check_disk_space(&config.paths.model_dir));
    checks.push(check_ui_port(config));

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(
                check = %check.name,
                message = %check.message,
                "Startup check PASSED"
            );
        } else if check.critical {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (non-critical)"
            );
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Startup checks completed"
    );

    report
}

/// Check that the daemon binary can be found.
/// Only critical when stagehand is the one spawning it.
fn check_daemon_binary(config: &Config) -> CheckResult {
    match resolve_program(&config.daemon.binary) {
        Some(path) => CheckResult::pass("daemon_binary", "Daemon binary found")
            .with_details(format!("Path: {}", path.display())),
        None => CheckResult::fail(
            "daemon_binary",
            format!("Daemon binary '{}' not found on PATH", config.daemon.binary),
            config.daemon.managed,
        )
        .with_details("An already-running external daemon can still be attached"),
    }
}

/// Check that the UI command can be found
fn check_ui_command(config: &Config) -> CheckResult {
    match resolve_program(&config.ui.command) {
        Some(path) => CheckResult::pass("ui_command", "UI command found")
            .with_details(format!("Path: {}", path.display())),
        None => CheckResult::fail(
            "ui_command",
            format!("UI command '{}' not found on PATH", config.ui.command),
            true,
        ),
    }
}

/// Create a directory if missing and verify it is writable
fn check_directory(dir: &Path, label: &str) -> CheckResult {
    let name = format!("{}_writable", label);

    if let Err(e) = ensure_dir(dir) {
        return CheckResult::fail(name, format!("Cannot create {}", dir.display()), true)
            .with_details(e.to_string());
    }

    let test_file = dir.join(".stagehand_write_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass(name, format!("{} is writable", dir.display()))
        }
        Err(e) => CheckResult::fail(name, format!("{} is not writable", dir.display()), true)
            .with_details(e.to_string()),
    }
}

/// Check available disk space for the model store
fn check_disk_space(model_dir: &Path) -> CheckResult {
    match DiskStats::for_path(model_dir) {
        Ok(stats) => {
            let free_gb = stats.free_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
            let min_gb = MIN_DISK_SPACE_BYTES as f64 / (1024.0 * 1024.0 * 1024.0);

            if stats.free_bytes >= MIN_DISK_SPACE_BYTES {
                CheckResult::pass(
                    "disk_space",
                    format!("Sufficient disk space ({:.2} GB free)", free_gb),
                )
                .with_details(format!("Usage: {:.1}%", stats.usage_percent))
            } else {
                // Model pulls run into tens of gigabytes; warn but allow startup
                CheckResult::fail(
                    "disk_space",
                    format!(
                        "Low disk space ({:.2} GB free, minimum {:.2} GB recommended)",
                        free_gb, min_gb
                    ),
                    false,
                )
                .with_details(format!("Usage: {:.1}%", stats.usage_percent))
            }
        }
        Err(e) => {
            CheckResult::fail("disk_space", "Failed to check disk space", false)
                .with_details(e.to_string())
        }
    }
}

/// Check that the UI port is not already bound
fn check_ui_port(config: &Config) -> CheckResult {
    let addr = (config.ui.host.as_str(), config.ui.port);
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            CheckResult::pass(
                "ui_port",
                format!("Port {} is available", config.ui.port),
            )
        }
        Err(e) => CheckResult::fail(
            "ui_port",
            format!(
                "Port {} on {} is not available",
                config.ui.port, config.ui.host
            ),
            true,
        )
        .with_details(e.to_string()),
    }
}
