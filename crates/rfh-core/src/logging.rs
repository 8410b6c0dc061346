//! Tracing subscriber setup for hosts embedding the core.

use tracing_subscriber::EnvFilter;

use crate::config::CoreConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when `RUST_LOG` is unset.
///
/// Fails instead of panicking if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(anyhow::Error::msg)
}

/// [`init_tracing`] with the configured log level applied to this crate.
pub fn init_from_config(config: &CoreConfig) -> anyhow::Result<()> {
    init_tracing(&format!("rfh_core={}", config.log_level))
}
