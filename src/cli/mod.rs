//! CLI module for the stagehand command-line interface.
//!
//! Provides subcommands for working with a configured stack:
//! - `check` - run preflight checks and exit
//! - `models list` - list models installed in the daemon
//! - `models pull [NAME]...` - ensure models are present
//! - `status` - probe the daemon and the UI server
//!
//! With no subcommand, stagehand runs as the supervisor; that path is
//! handled in main.rs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, ModelsConfig};
use crate::daemon::{DaemonClient, ModelStore};
use crate::provision;
use crate::readiness;
use crate::startup;
use crate::utils::format_bytes;

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about = "A lightweight startup supervisor for local model stacks", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "stagehand.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Skip startup self-checks (for development only)
    #[arg(long)]
    pub skip_checks: bool,

    /// Daemon URL override (default: the configured daemon.url)
    #[arg(long, env = "STAGEHAND_DAEMON_URL")]
    pub daemon_url: Option<String>,

    /// Subcommand to run (if none, runs the supervisor)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run preflight checks and exit
    Check,

    /// Model management commands
    #[command(subcommand)]
    Models(ModelsCommands),

    /// Probe the daemon and the UI server
    Status,
}

/// Models subcommands
#[derive(Subcommand, Debug)]
pub enum ModelsCommands {
    /// List models installed in the daemon
    List,
    /// Ensure models are present, pulling what is missing
    Pull {
        /// Model names (default: the configured required set)
        names: Vec<String>,
    },
}

/// Run a CLI subcommand
pub async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Some(Commands::Check) => cmd_check(config),
        Some(Commands::Models(ModelsCommands::List)) => cmd_models_list(cli, config).await,
        Some(Commands::Models(ModelsCommands::Pull { names })) => {
            cmd_models_pull(cli, config, names).await
        }
        Some(Commands::Status) => cmd_status(cli, config).await,
        // No subcommand means run the supervisor - handled in main.rs
        None => Ok(()),
    }
}

fn daemon_client(cli: &Cli, config: &Config) -> DaemonClient {
    let url = cli.daemon_url.as_deref().unwrap_or(&config.daemon.url);
    DaemonClient::new(url, Duration::from_secs(config.models.pull_timeout_secs))
}

/// Hosts that mean "every interface" cannot be connected to directly
fn probe_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        other => other,
    }
}

/// Run preflight checks and report them
fn cmd_check(config: &Config) -> Result<()> {
    let report = startup::run_startup_checks(config);

    println!();
    println!("=== Startup Checks ===");
    println!();
    for check in &report.checks {
        let icon = if check.passed {
            "[OK]"
        } else if check.critical {
            "[!!]"
        } else {
            "[--]"
        };
        println!("{} {:<20} {}", icon, check.name, check.message);
        if !check.passed {
            if let Some(details) = &check.details {
                println!("     {:<20} {}", "", details);
            }
        }
    }
    println!();
    println!("{}", report.summary);

    if !report.all_critical_passed {
        bail!("Critical startup checks failed");
    }
    Ok(())
}

/// List models installed in the daemon
async fn cmd_models_list(cli: &Cli, config: &Config) -> Result<()> {
    let client = daemon_client(cli, config);
    let models = client
        .list_models()
        .await
        .context("Failed to list models. Is the daemon running?")?;

    if models.is_empty() {
        println!("No models installed");
        return Ok(());
    }

    println!("{:<40} {:>10}  {}", "NAME", "SIZE", "MODIFIED");
    for model in &models {
        let modified = model
            .modified_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:>10}  {}",
            model.name,
            format_bytes(model.size),
            modified
        );
    }
    Ok(())
}

/// Ensure models are present, pulling missing ones
async fn cmd_models_pull(cli: &Cli, config: &Config, names: &[String]) -> Result<()> {
    let client = daemon_client(cli, config);

    let models = if names.is_empty() {
        config.models.clone()
    } else {
        ModelsConfig {
            required: names.to_vec(),
            ..config.models.clone()
        }
    };

    let report = provision::ensure_models(&client, &models).await?;

    for name in &report.present {
        println!("present  {}", name);
    }
    for name in &report.pulled {
        println!("pulled   {}", name);
    }
    Ok(())
}

/// Probe the daemon and the UI server and report component health
async fn cmd_status(cli: &Cli, config: &Config) -> Result<()> {
    let client = daemon_client(cli, config);

    let daemon_version = client.version().await.ok();
    let daemon_healthy = daemon_version.is_some();

    let models = if daemon_healthy {
        client.list_models().await.unwrap_or_default()
    } else {
        Vec::new()
    };
    let missing = provision::missing_models(
        &config.models.required,
        &models.iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
    );

    let ui_up = readiness::port_open(
        probe_host(&config.ui.host),
        config.ui.port,
        Duration::from_secs(2),
    )
    .await;

    println!();
    println!("=== Stack Status ===");
    println!();
    match &daemon_version {
        Some(version) => println!("Daemon:     [OK] v{} at {}", version, config.daemon.url),
        None => println!("Daemon:     [!!] unreachable at {}", config.daemon.url),
    }
    if daemon_healthy {
        if missing.is_empty() {
            println!(
                "Models:     [OK] {}/{} required models present",
                config.models.required.len(),
                config.models.required.len()
            );
        } else {
            println!("Models:     [!!] missing: {}", missing.join(", "));
        }
    } else {
        println!("Models:     [??] daemon unreachable");
    }
    if ui_up {
        println!(
            "UI:         [OK] listening on {}:{}",
            config.ui.host, config.ui.port
        );
    } else {
        println!(
            "UI:         [!!] nothing listening on {}:{}",
            config.ui.host, config.ui.port
        );
    }
    println!();

    if !daemon_healthy || !ui_up {
        bail!("One or more components are down");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_host_rewrites_wildcard() {
        assert_eq!(probe_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(probe_host("::"), "127.0.0.1");
        assert_eq!(probe_host("192.168.1.5"), "192.168.1.5");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["stagehand"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("stagehand.toml"));
        assert!(cli.command.is_none());
        assert!(!cli.skip_checks);
    }

    #[test]
    fn test_cli_models_pull_names() {
        let cli = Cli::try_parse_from(["stagehand", "models", "pull", "llama3:8b"]).unwrap();
        match cli.command {
            Some(Commands::Models(ModelsCommands::Pull { names })) => {
                assert_eq!(names, vec!["llama3:8b".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_check_subcommand() {
        let cli = Cli::try_parse_from(["stagehand", "--skip-checks", "check"]).unwrap();
        assert!(cli.skip_checks);
        assert!(matches!(cli.command, Some(Commands::Check)));
    }
}
