//! Cluster pairing commands.

use anyhow::Result;
use console::style;

use ferry_sched::{pair_clusters, ClusterPair, PairStatus, SchedulerConfig};

use super::common::open_store;

/// Execute the pair command.
pub async fn execute(
    config: &SchedulerConfig,
    cluster: &str,
    version: i64,
    peer: &str,
    peer_version: i64,
    status: &str,
) -> Result<()> {
    let status: PairStatus = status
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}. Available: PAIRED, UNPAIRED, SUSPENDED"))?;
    let pair = ClusterPair::new(cluster, version, peer, peer_version, status);

    let store = open_store(config)?;
    pair_clusters(store.as_ref(), &pair)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to pair clusters: {e}"))?;

    println!(
        "{} {} v{} and {} v{} are now {}",
        style("✓").green().bold(),
        style(cluster).bold(),
        version,
        style(peer).bold(),
        peer_version,
        style(status).cyan()
    );
    Ok(())
}

/// Execute the pairs command: list the pairs a cluster takes part in.
pub async fn execute_list(config: &SchedulerConfig, cluster: &str, version: i64) -> Result<()> {
    let store = open_store(config)?;
    let pairs = store
        .paired_clusters(cluster, version)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query cluster pairs: {e}"))?;

    if pairs.is_empty() {
        println!("Cluster {cluster} v{version} is not paired.");
        return Ok(());
    }

    println!(
        "  {:<24}  {:<8}  {:<10}  {}",
        style("PEER").bold(),
        style("VERSION").bold(),
        style("STATUS").bold(),
        style("MODIFIED").bold()
    );
    println!("  {}", "-".repeat(70));
    for pair in &pairs {
        let (peer, peer_version) = pair.peer_of(cluster);
        println!(
            "  {:<24}  {:<8}  {:<10}  {}",
            peer,
            peer_version,
            pair.status.name(),
            pair.last_modified.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
