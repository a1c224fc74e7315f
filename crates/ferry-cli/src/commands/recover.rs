//! Recover command implementation.
//!
//! Resume every instance a previous process left `RUNNING` and wait for
//! them to finish.

use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use ferry_sched::{RecoveryCoordinator, SchedulerConfig};

use super::common::{create_scheduler, styled_status};

/// Execute the recover command.
pub async fn execute(config: &SchedulerConfig) -> Result<()> {
    let scheduler = create_scheduler(config, None).await?;

    let resumed = RecoveryCoordinator::new(scheduler.clone())
        .recover_all()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to scan for interrupted instances: {e}"))?;

    if resumed.is_empty() {
        println!("No interrupted instances.");
        return Ok(());
    }
    println!(
        "{} Resuming {} instance(s)",
        style("→").cyan().bold(),
        resumed.len()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .map_err(|e| anyhow::anyhow!("Invalid progress template: {e}"))?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut outcomes = Vec::with_capacity(resumed.len());
    for instance_id in &resumed {
        spinner.set_message(format!("Waiting for {instance_id}..."));
        let outcome = scheduler.wait(instance_id).await;
        outcomes.push((instance_id, outcome));
    }
    spinner.finish_and_clear();
    scheduler.shutdown().await;

    for (instance_id, outcome) in outcomes {
        match outcome {
            Ok(instance) => println!(
                "  {:<32}  {:<12}  {} attempt(s)",
                style(instance_id).dim(),
                styled_status(instance.status),
                instance.run_count
            ),
            Err(e) => println!(
                "  {:<32}  {}",
                style(instance_id).dim(),
                style(format!("error: {e}")).red()
            ),
        }
    }
    Ok(())
}
