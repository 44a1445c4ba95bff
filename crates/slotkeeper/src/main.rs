//! slotkeeper - single-slot terminal session arbiter

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use slotkeeper::{Config, Production, SlotkeeperServerBuilder};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slotkeeper")]
#[command(about = "Queue visitors for a single sandboxed terminal session")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen address (overrides server.ws_bind)
    #[arg(long)]
    ws_bind: Option<String>,

    /// HTTP API listen address (overrides server.http_bind)
    #[arg(long)]
    http_bind: Option<String>,

    /// Log filter, e.g. `debug` or `slotkeeper_orchestrator=trace` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = cli.ws_bind {
        config.server.ws_bind = addr;
    }
    if let Some(addr) = cli.http_bind {
        config.server.http_bind = addr;
    }

    let backend = Production::backend(&config)
        .await
        .context("failed to prepare session backend")?;
    let server = SlotkeeperServerBuilder::new()
        .config(config)
        .build::<Production>(backend)
        .await
        .context("failed to start server")?;

    tracing::info!(
        ws = %server.local_addr()?,
        http = %server.http_addr()?,
        "listening"
    );

    let orchestrator = server.orchestrator();
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}
