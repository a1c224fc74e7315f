//! Submit command implementation.
//!
//! Register a policy from a YAML file and start an instance of it.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use ferry_sched::{JobStatus, PolicyInstance, PolicyScheduler, ReplicationPolicy, SchedulerConfig};

use super::common::{create_scheduler, print_jobs, styled_status};

/// Execute the submit command.
pub async fn execute(config: &SchedulerConfig, policy_path: &Path, wait: bool) -> Result<()> {
    let policy = ReplicationPolicy::from_file(policy_path).map_err(|e| {
        anyhow::anyhow!("Failed to load policy {}: {e}", policy_path.display())
    })?;
    let scheduler = create_scheduler(config, Some(&policy)).await?;

    scheduler
        .register_policy(&policy)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to register policy: {e}"))?;
    let instance_id = scheduler
        .submit_and_track(&policy.name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to submit policy: {e}"))?;

    println!(
        "{} Policy {} submitted as instance {}",
        style("✓").green().bold(),
        style(&policy.name).bold(),
        style(&instance_id).cyan()
    );

    if !wait {
        // Without this process the instance stays RUNNING until recovered
        scheduler.shutdown().await;
        println!(
            "  Use 'ferry recover' to resume it, 'ferry status {}' to check it.",
            instance_id
        );
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .map_err(|e| anyhow::anyhow!("Invalid progress template: {e}"))?,
    );
    spinner.set_message("Starting...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let waiter = scheduler.wait(&instance_id);
    tokio::pin!(waiter);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let instance: PolicyInstance = loop {
        tokio::select! {
            result = &mut waiter => {
                break result.map_err(|e| anyhow::anyhow!("Failed to wait for instance: {e}"))?;
            }
            _ = ticker.tick() => {
                if let Ok(Some(current)) = scheduler.store().load_instance(&instance_id).await {
                    spinner.set_message(format!(
                        "{} attempt {} at job {}",
                        current.status, current.run_count, current.current_offset
                    ));
                }
            }
        }
    };
    spinner.finish_and_clear();

    let jobs = scheduler
        .instance_jobs(&instance_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance jobs: {e}"))?;
    scheduler.shutdown().await;

    println!(
        "{} Instance {} finished: {} after {} attempt(s)",
        if instance.status == JobStatus::Success {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        },
        style(&instance_id).cyan(),
        styled_status(instance.status),
        instance.run_count
    );
    if let Some(message) = &instance.message {
        println!("  {}", style(message).dim());
    }
    println!();
    print_jobs(&jobs);
    Ok(())
}
