//! Correlation ID for request/reply matching.
//!
//! A 128-bit random identifier. The nil value marks a message that expects
//! no reply.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation ID carried in the broker's native correlation-id field.
///
/// Unique per outstanding request. [`CorrelationId::NONE`] is never
/// registered and never resolves a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// The absent correlation id (all zero bits).
    pub const NONE: CorrelationId = CorrelationId(Uuid::nil());

    /// Generate a fresh random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from the raw 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse from the hyphenated string form.
    ///
    /// Empty input parses to [`CorrelationId::NONE`], matching brokers that
    /// send an empty correlation-id property.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        if s.is_empty() {
            return Ok(Self::NONE);
        }
        Uuid::parse_str(s).map(Self)
    }

    /// True if this is the absent (nil) id.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Returns `None` for the absent id, `Some(self)` otherwise.
    pub fn into_option(self) -> Option<Self> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}
