//! Run command implementation.
//!
//! Start the configured services and keep the scheduler running until
//! interrupted.

use anyhow::Result;
use console::style;
use tracing::info;

use ferry_sched::{SchedulerConfig, ServiceDeps, ServiceManager, ServiceRegistry};

use super::common::create_scheduler;

/// Execute the run command.
pub async fn execute(config: &SchedulerConfig) -> Result<()> {
    let scheduler = create_scheduler(config, None).await?;
    let deps = ServiceDeps {
        scheduler: scheduler.clone(),
        config: config.clone(),
    };

    let mut services = ServiceManager::start(&ServiceRegistry::builtin(), &config.services, &deps)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start services: {e}"))?;

    println!(
        "{} Scheduler running with services: {}",
        style("✓").green().bold(),
        services.names().join(", ")
    );
    println!("  Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl-C: {e}"))?;
    info!("Shutting down");

    let stopped = services.shutdown().await;
    scheduler.shutdown().await;
    stopped.map_err(|e| anyhow::anyhow!("Failed to stop services: {e}"))
}
