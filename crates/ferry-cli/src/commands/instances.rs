//! Instances command implementation.

use anyhow::Result;
use console::style;

use ferry_sched::{InstanceFilter, JobStatus, SchedulerConfig};

use super::common::{open_store, styled_status};

/// Execute the instances command.
pub async fn execute(
    config: &SchedulerConfig,
    policy: Option<&str>,
    status: Option<&str>,
    retired: bool,
    limit: Option<usize>,
) -> Result<()> {
    let mut filter = InstanceFilter::all();
    if let Some(policy) = policy {
        filter = filter.with_policy(policy);
    }
    if let Some(status) = status {
        let status: JobStatus = status.parse().map_err(|_| {
            anyhow::anyhow!(
                "Unknown status '{status}'. Available: NOT_STARTED, RUNNING, SUCCESS, FAILED, KILLED"
            )
        })?;
        filter = filter.with_status(status);
    }
    if retired {
        filter = filter.with_retired();
    }
    if let Some(limit) = limit {
        filter = filter.with_limit(limit);
    }

    let store = open_store(config)?;
    let instances = store
        .list_instances(&filter)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list instances: {e}"))?;

    if instances.is_empty() {
        println!("No instances found.");
        return Ok(());
    }

    println!("{} {} instance(s):\n", style("→").cyan().bold(), instances.len());
    println!(
        "  {:<32}  {:<12}  {:<5}  {:<16}  {}",
        style("INSTANCE").bold(),
        style("STATUS").bold(),
        style("RUNS").bold(),
        style("CREATED").bold(),
        style("MESSAGE").bold()
    );
    println!("  {}", "-".repeat(100));

    for instance in &instances {
        println!(
            "  {:<32}  {:<12}  {:<5}  {:<16}  {}",
            style(&instance.id).dim(),
            styled_status(instance.status),
            instance.run_count,
            instance.created_at.format("%Y-%m-%d %H:%M"),
            instance.message.as_deref().unwrap_or("")
        );
    }

    Ok(())
}
