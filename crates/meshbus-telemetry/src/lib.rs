//! # Meshbus Telemetry
//!
//! Structured logging for Meshbus processes, built on `tracing-subscriber`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshbus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("telemetry");
//!     // Nodes now log with structured fields (correlation_id, address, ...)
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MB_SERVICE_NAME` | `meshbus` | Service name in the startup log line |
//! | `MB_LOG_LEVEL` / `RUST_LOG` | `info` | `EnvFilter` directives |
//! | `MB_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `MB_LOG_LOCATIONS` | `false` | Include file and line |

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Install the global tracing subscriber.
///
/// Returns a guard to hold for the lifetime of the process.
///
/// # Errors
///
/// Fails on an invalid filter or if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    tracing_setup::init_tracing(&config)?;
    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}
