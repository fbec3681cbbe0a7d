use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand::cli::{self, Cli};
use stagehand::config::Config;
use stagehand::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config)?;

    if let Some(url) = &cli.daemon_url {
        config.daemon.url = url.clone();
    }

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.command.is_some() {
        return cli::run_command(&cli, &config).await;
    }

    tracing::info!("Starting stagehand v{}", env!("CARGO_PKG_VERSION"));

    Supervisor::new(config).run(cli.skip_checks).await
}
