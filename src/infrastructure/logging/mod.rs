// Logging module - tracing subscriber setup
use crate::domain::error::{BtSerialError, BtSerialResult};
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub fn default_filter(level: &str) -> String {
    format!("btserial={},warn", level)
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init_logging(level: &str) -> BtSerialResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(level)))
        .map_err(|e| BtSerialError::InvalidInput(format!("invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| BtSerialError::Config {
            message: format!("logging already initialised: {}", e),
        })?;

    tracing::debug!("btserial logging initialised at '{}'", level);
    Ok(())
}
