//! Tracing initialization from configuration.
//!
//! `RUST_LOG` wins when set; otherwise the configured `application.log_level`
//! applies to every target:
//!
//! ```bash
//! RUST_LOG=flowcell_daq::experiment=debug flowcell_daq --simulate
//! FLOWCELL_APPLICATION__LOG_FORMAT=json flowcell_daq --simulate
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{AppResult, DaqError};

/// Build the filter: `RUST_LOG` if present, else the configured level.
pub fn env_filter(app: &ApplicationConfig) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&app.log_level).map_err(|e| {
            DaqError::Configuration(format!("Invalid log_level '{}': {e}", app.log_level))
        }),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed (tests, embedding).
pub fn init(app: &ApplicationConfig) -> AppResult<bool> {
    let filter = env_filter(app)?;
    let installed = match app.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    };
    Ok(installed)
}
