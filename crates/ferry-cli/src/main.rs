//! Ferry Command-Line Interface
//!
//! Operator CLI for the Ferry replication scheduler. Commands run against a
//! SQLite state database in the state directory (`~/.ferry` unless
//! `FERRY_STATE_DIR` or the configuration file says otherwise) and drive
//! copies through the simulated engine.
//!
//! ```text
//!   primary cluster                        backup cluster
//!   /apps/warehouse  ─────  ferry  ─────▶  /apps/warehouse
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

mod commands;
mod logging;

use commands::{common, housekeep, instances, pair, recover, run, status, submit};
use logging::LogFormat;

/// Ferry - cross-cluster replication orchestration
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Scheduler configuration file (YAML)
    #[arg(short, long, env = "FERRY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a policy from a YAML file and start an instance of it
    Submit {
        /// Policy file (YAML)
        policy: PathBuf,

        /// Wait for the instance to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the status of an instance
    Status {
        /// Instance ID (<policy>@<sequence>)
        instance: String,
    },

    /// List policy instances
    Instances {
        /// Only instances of this policy
        #[arg(short, long)]
        policy: Option<String>,

        /// Only instances with this status (RUNNING, SUCCESS, FAILED, KILLED)
        #[arg(short, long)]
        status: Option<String>,

        /// Include retired instances
        #[arg(long)]
        retired: bool,

        /// Maximum number of instances to list
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Resume instances left running by a previous process
    Recover,

    /// Retire and purge old instances once
    Housekeep,

    /// Pair two cluster versions
    Pair {
        /// Cluster name
        cluster: String,

        /// Cluster version
        version: i64,

        /// Peer cluster name
        peer: String,

        /// Peer cluster version
        peer_version: i64,

        /// Pair status (PAIRED, UNPAIRED, SUSPENDED)
        #[arg(long, default_value = "PAIRED")]
        status: String,
    },

    /// List the pairs a cluster version takes part in
    Pairs {
        /// Cluster name
        cluster: String,

        /// Cluster version
        version: i64,
    },

    /// Run the scheduler with its configured services until interrupted
    Run,
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = common::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Submit { policy, wait } => submit::execute(&config, &policy, wait).await,

        Commands::Status { instance } => status::execute(&config, &instance).await,

        Commands::Instances {
            policy,
            status,
            retired,
            limit,
        } => {
            instances::execute(&config, policy.as_deref(), status.as_deref(), retired, limit).await
        }

        Commands::Recover => recover::execute(&config).await,

        Commands::Housekeep => housekeep::execute(&config).await,

        Commands::Pair {
            cluster,
            version,
            peer,
            peer_version,
            status,
        } => pair::execute(&config, &cluster, version, &peer, peer_version, &status).await,

        Commands::Pairs { cluster, version } => {
            pair::execute_list(&config, &cluster, version).await
        }

        Commands::Run => run::execute(&config).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.log_format);

    if let Err(e) = dispatch(cli).await {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
