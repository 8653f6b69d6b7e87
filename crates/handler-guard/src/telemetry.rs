//! Log subscriber setup.
//!
//! JSON lines for containers and production, compact text for development.
//! `RUST_LOG` overrides the configured filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::domain::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber is already installed, which leaves
/// the existing one in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| TelemetryError::Filter {
            filter: config.filter.clone(),
            reason: e.to_string(),
        })?;

    let installed = if config.json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .is_ok()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    }
    Ok(installed)
}
