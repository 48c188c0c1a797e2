//! Orchestrator HTTP server
//!
//! ```bash
//! orchestrator-server --config config/orchestrator.toml
//! ORCH_BIND=0.0.0.0:8088 RUST_LOG=orchestration=debug orchestrator-server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use orchestration::{Orchestrator, OrchestratorConfig};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "ORCH_CONFIG", default_value = "config/orchestrator.toml")]
    config: PathBuf,

    /// Listen address (overrides `bind` in the file and ORCH_BIND)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = OrchestratorConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let orchestrator =
        Orchestrator::from_config(&config).context("Failed to build orchestrator")?;
    let app = orchestrator_server::router(Arc::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(
        bind = %config.bind,
        config = %args.config.display(),
        providers = config.providers.len(),
        "Orchestrator server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;
    Ok(())
}
