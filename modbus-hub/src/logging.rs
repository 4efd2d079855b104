//! Tracing setup for binaries and demos embedding the hubs.
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{HubError, Result};

/// Install the global subscriber at `info`, or whatever `RUST_LOG` says.
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Install the global subscriber with `filter` (e.g. `"modbus_hub=debug"`)
/// unless `RUST_LOG` is set.
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| HubError::config(format!("failed to initialize logging: {e}")))
}
