//!
//! Module to initialize tracing logs.
//!
//! Call this before starting the agent so config and startup errors are not
//! lost. `RUST_LOG` wins over the passed directive.
//!

use tracing_subscriber::EnvFilter;

/// Initialize the tracing logger with `directive` (e.g. `info`) as the
/// default level.
pub fn init_tracing_logs(directive: &str) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
    Ok(())
}
