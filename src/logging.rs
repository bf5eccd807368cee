//! Logging Setup
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` directives take
//! precedence; the configured level is the default directive. Output goes
//! to stderr so the console summary on stdout stays clean.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber described by `config`
///
/// # Errors
///
/// Returns an error if the level is invalid or a global subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level: Level = config
        .level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow!("Failed to parse log level '{}': {}", config.level, e))?;
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level, &directives))
        .with_writer(std::io::stderr);

    let installed = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

fn filter(level: Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives)
}
