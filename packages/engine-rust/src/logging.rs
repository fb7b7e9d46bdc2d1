//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Safe to call more than
/// once: later calls report an error instead of panicking.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global subscriber
/// is already installed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
