//! ReMem PRAXIS binary
//!
//! Hosts the experience engine in-process: restores the configured snapshot,
//! waits for Ctrl-C, then writes the snapshot back.

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remem_praxis::{config::RememConfig, RememService, PRAXIS_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting ReMem PRAXIS v{}", PRAXIS_VERSION);

    let config = RememConfig::load().context("Failed to load configuration")?;
    info!("Loaded configuration: {:?}", config);

    let service = RememService::new(config).context("Failed to build service")?;

    if let Some(path) = service.config().store.snapshot_path.clone() {
        if path.exists() {
            let restored = service
                .restore(&path)
                .await
                .with_context(|| format!("Failed to restore {}", path.display()))?;
            info!(restored, path = %path.display(), "Experiences restored");
        } else {
            warn!(path = %path.display(), "Snapshot not found, starting empty");
        }
    }

    let stats = service.stats().await;
    info!(
        experiences = stats.total,
        capacity = stats.capacity,
        agents = stats.unique_agents,
        breakthroughs = stats.breakthroughs,
        shards = service.index().stats().len(),
        "ReMem ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    info!("Received shutdown signal");

    service.shutdown().await.context("Shutdown failed")?;
    Ok(())
}
