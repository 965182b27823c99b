//! keeld - Keel workspace reconciliation daemon
//!
//! Consumes the workspace event stream, keeps release-target state current,
//! and dispatches deployment jobs as policy allows.

use clap::Parser;
use keel_engine::{EngineConfig, Server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keel Daemon CLI
#[derive(Parser)]
#[command(name = "keeld")]
#[command(about = "Keel Daemon - Workspace deployment reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<String>,

    /// Workspace id (overrides configuration)
    #[arg(short, long, env = "KEEL_WORKSPACE")]
    workspace: Option<String>,

    /// Log level (overrides configuration)
    #[arg(long, env = "KEEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "KEEL_LOG_JSON")]
    json: bool,

    /// Newline-delimited events to publish at startup
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(workspace) = cli.workspace {
        config.workspace.id = workspace;
    }

    // Initialize tracing
    let level = cli
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workspace_id = %config.workspace.id,
        "Starting keeld"
    );

    let server = Server::new(config).await?;
    if let Some(path) = cli.replay {
        server.replay(&path).await?;
    }
    server.run().await?;
    Ok(())
}
