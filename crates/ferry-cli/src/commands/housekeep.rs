//! Housekeep command implementation.
//!
//! Run each built-in housekeeping task once.

use anyhow::Result;
use console::style;

use ferry_sched::housekeeping::builtin_tasks;
use ferry_sched::{Clock, HousekeepingPool, SchedulerConfig};

use super::common::open_store;

/// Execute the housekeep command.
pub async fn execute(config: &SchedulerConfig) -> Result<()> {
    let store = open_store(config)?;
    let pool = HousekeepingPool::new(store, Clock::new(), config.housekeeping.threads);

    for task in builtin_tasks(&config.housekeeping) {
        let affected = pool
            .run_once(task.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("Housekeeping task {} failed: {e}", task.name()))?;
        println!(
            "{} {:<18} {} instance(s)",
            style("✓").green().bold(),
            task.name(),
            affected
        );
    }
    Ok(())
}
