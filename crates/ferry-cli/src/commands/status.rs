//! Status command implementation.
//!
//! Show one instance from the local state store: its status, the chain view
//! and the copy jobs of the current attempt.

use anyhow::Result;
use console::style;

use ferry_sched::{InstanceId, SchedulerConfig};

use super::common::{open_store, print_jobs, styled_status};

/// Execute the status command.
pub async fn execute(config: &SchedulerConfig, instance: &str) -> Result<()> {
    let instance_id = InstanceId::parse(instance).ok_or_else(|| {
        anyhow::anyhow!("Invalid instance ID '{instance}': expected <policy>@<sequence>")
    })?;
    let store = open_store(config)?;

    let record = store
        .load_instance(&instance_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Instance not found: {instance_id}"))?;

    println!(
        "{} Instance {} status: {}",
        style("→").cyan().bold(),
        style(&instance_id).dim(),
        styled_status(record.status).bold()
    );
    println!("  Policy:   {}", record.policy_name);
    println!("  Attempts: {}", record.run_count);
    println!("  Created:  {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(start) = record.start_time {
        println!("  Started:  {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(end) = record.end_time {
        println!("  Ended:    {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(message) = &record.message {
        println!("  Message:  {}", style(message).dim());
    }
    if record.terminal {
        println!("  Terminal: {}", style("yes").dim());
    }
    if let Some(retired) = record.retirement_time {
        println!("  Retired:  {}", retired.format("%Y-%m-%d %H:%M:%S"));
    }

    let jobs = store
        .instance_jobs(&instance_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load instance jobs: {e}"))?;
    println!();
    print_jobs(&jobs);

    let tracking = store
        .load_tracking_info(&instance_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load tracking info: {e}"))?;
    if !tracking.is_empty() {
        println!("\n  {}", style("Copy jobs of the current attempt:").bold());
        for metrics in tracking.entries() {
            println!(
                "  {:<24}  {:<9}  {} tasks completed",
                style(&metrics.job_id).yellow(),
                metrics.job_type.name(),
                metrics.completed_tasks
            );
        }
    }

    Ok(())
}
