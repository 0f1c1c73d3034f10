//! Telemetry configuration from environment variables.

use std::env;

/// Logging configuration for a Meshbus process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,

    /// Filter directives (trace, debug, info, warn, error or full `EnvFilter` syntax)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to include file and line in log lines
    pub with_locations: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "meshbus".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_locations: false,
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MB_SERVICE_NAME`: Service name (default: meshbus)
    /// - `MB_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `MB_JSON_LOGS`: Enable JSON logs (default: true in containers)
    /// - `MB_LOG_LOCATIONS`: Include file/line (default: false)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("MB_SERVICE_NAME").unwrap_or_else(|_| "meshbus".to_string()),

            log_level: env::var("MB_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            json_logs: env::var("MB_JSON_LOGS")
                .map(|v| flag(&v))
                .unwrap_or(is_container),

            with_locations: env::var("MB_LOG_LOCATIONS")
                .map(|v| flag(&v))
                .unwrap_or(false),
        }
    }

    /// Configuration for a named node process.
    pub fn for_service(service_name: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = service_name.to_string();
        config
    }
}
