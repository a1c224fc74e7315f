//! Logging setup.

use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable console output
    #[default]
    Text,
    /// JSON structured logging, one event per line
    Json,
}

/// Filter directive for a `-v` count. `RUST_LOG` wins when set.
pub fn filter_for(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Logs go to stderr so command output stays
/// machine readable.
pub fn init(verbose: u8, format: LogFormat) {
    let filter = filter_for(verbose);
    match format {
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .init(),
    }
}
