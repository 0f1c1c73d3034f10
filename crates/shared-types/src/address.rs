//! # Service Addresses
//!
//! An address names a service or event stream as `namespace:key`. The
//! namespace selects the broker exchange and the key is the routing key.
//!
//! ```text
//! "billing:invoice.create"
//!    │         │
//!    │         └── routing key (may hold `*` / `#` when used as a pattern)
//!    └── exchange
//! ```

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed `namespace:key` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    namespace: String,
    key: String,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_key_char(c: char) -> bool {
    is_name_char(c) || matches!(c, '*' | '#')
}

impl ServiceAddress {
    /// Build an address from its parts, validating both.
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let namespace = namespace.into();
        let key = key.into();

        if namespace.is_empty() || !namespace.chars().all(is_name_char) {
            return Err(ConfigurationError::InvalidAddress(format!(
                "{}:{}",
                namespace, key
            )));
        }
        if key.is_empty() || !key.chars().all(is_key_char) {
            return Err(ConfigurationError::InvalidAddress(format!(
                "{}:{}",
                namespace, key
            )));
        }

        Ok(Self { namespace, key })
    }

    /// Parse `namespace:key`.
    pub fn parse(text: &str) -> Result<Self, ConfigurationError> {
        let (namespace, key) = text
            .split_once(':')
            .ok_or_else(|| ConfigurationError::InvalidAddress(text.to_string()))?;
        Self::new(namespace, key)
    }

    /// The exchange part.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The routing key part.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True if the key contains topic wildcards.
    pub fn is_pattern(&self) -> bool {
        self.key.contains('*') || self.key.contains('#')
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

impl FromStr for ServiceAddress {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ServiceAddress {
    type Error = ConfigurationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// Single-hop namespace rewrite applied to outbound addresses.
///
/// Only one rule is ever applied to an address; translated addresses are not
/// translated again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRule {
    /// Namespace to match.
    pub from: String,
    /// Replacement namespace.
    pub to: String,
}

impl TranslationRule {
    /// Create a rule mapping `from` to `to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self, ConfigurationError> {
        let from = from.into();
        let to = to.into();
        for part in [&from, &to] {
            if part.is_empty() || !part.chars().all(is_name_char) {
                return Err(ConfigurationError::InvalidSetting(format!(
                    "translation rule namespace '{}' is invalid",
                    part
                )));
            }
        }
        Ok(Self { from, to })
    }

    /// Parse `from=to`.
    pub fn parse(text: &str) -> Result<Self, ConfigurationError> {
        let (from, to) = text.split_once('=').ok_or_else(|| {
            ConfigurationError::InvalidSetting(format!("translation rule '{}' is not from=to", text))
        })?;
        Self::new(from.trim(), to.trim())
    }

    /// Apply the rule. Addresses outside `from` are returned unchanged.
    pub fn apply(&self, address: &ServiceAddress) -> ServiceAddress {
        if address.namespace == self.from {
            ServiceAddress {
                namespace: self.to.clone(),
                key: address.key.clone(),
            }
        } else {
            address.clone()
        }
    }
}
