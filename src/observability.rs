//! Logging initialization.

use crate::error::{BallastError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level. Safe to call
/// once per process; a second call reports an error from the subscriber
/// registry.
pub fn init(log_level: &str, json_logs: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| BallastError::Internal(format!("failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| BallastError::Internal(format!("failed to init logging: {}", e)))?;
    }

    Ok(())
}
