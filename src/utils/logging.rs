//! Logging setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either
//! human-readable or JSON output. `RUST_LOG`, when set, wins over the
//! configured level.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Initializes the global subscriber.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place and return `Ok(false)`.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let level = config.log_level.as_str().to_ascii_lowercase();
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&level)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid log filter '{level}': {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(app = %config.app_name, level = %level, "Logging initialized");
    }
    Ok(installed)
}
