//! # Node Configuration
//!
//! Runtime parameters for a node. Key material for the secure channel is
//! never read from the environment; set [`NodeConfig::secure`] in code.
//!
//! | Variable | Default | Field |
//! |----------|---------|-------|
//! | `MB_APP_ID` | `meshbus` | `app_id` |
//! | `MB_APP_VERSION` | crate version | `app_version` |
//! | `MB_DEFAULT_TIMEOUT_MS` | `30000` | `default_timeout` |
//! | `MB_REPLY_QUEUE_EXPIRY_MS` | `60000` | `reply_queue_expiry` |
//! | `MB_RECONNECT_ATTEMPTS` | `5` | `reconnect_attempts` |
//! | `MB_RECONNECT_DELAY_MS` | `500` | `reconnect_delay` |
//! | `MB_TRANSLATE` | unset | `translation` (`from=to`) |

use mb_04_secure_channel::SecureClientConfig;
use shared_types::{ConfigurationError, TranslationRule};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Application identifier stamped on outbound messages.
    pub app_id: String,
    pub app_version: String,
    /// Timeout for asks and broadcasts that don't set one.
    pub default_timeout: Duration,
    /// Idle expiry of the private reply queue.
    pub reply_queue_expiry: Duration,
    /// Channel rebuild attempts before the node is torn down.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Optional single-hop namespace rewrite for outbound addresses.
    pub translation: Option<TranslationRule>,
    /// Secure channel client settings.
    pub secure: SecureClientConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            app_id: "meshbus".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            default_timeout: Duration::from_millis(30_000),
            reply_queue_expiry: Duration::from_millis(60_000),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            translation: None,
            secure: SecureClientConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError> {
    value.trim().parse().map_err(|_| {
        ConfigurationError::InvalidSetting(format!("{} has invalid value '{}'", name, value))
    })
}

impl NodeConfig {
    /// Defaults overridden by `MB_*` environment variables.
    ///
    /// # Errors
    ///
    /// `InvalidSetting` for unparsable values or a configuration that fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("MB_APP_ID") {
            config.app_id = v;
        }
        if let Some(v) = lookup("MB_APP_VERSION") {
            config.app_version = v;
        }
        if let Some(v) = lookup("MB_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(parse_var("MB_DEFAULT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("MB_REPLY_QUEUE_EXPIRY_MS") {
            config.reply_queue_expiry =
                Duration::from_millis(parse_var("MB_REPLY_QUEUE_EXPIRY_MS", &v)?);
        }
        if let Some(v) = lookup("MB_RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_var("MB_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("MB_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(parse_var("MB_RECONNECT_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("MB_TRANSLATE") {
            config.translation = Some(TranslationRule::parse(&v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings a node cannot run with.
    ///
    /// # Errors
    ///
    /// `InvalidSetting` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigurationError::InvalidSetting("app_id is empty".into()));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigurationError::InvalidSetting(
                "default_timeout must be positive".into(),
            ));
        }
        if self.reply_queue_expiry.is_zero() {
            return Err(ConfigurationError::InvalidSetting(
                "reply_queue_expiry must be positive".into(),
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "reconnect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
