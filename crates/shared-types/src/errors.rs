//! # Error Types
//!
//! The error taxonomy shared across Meshbus crates.
//!
//! | Kind | Examples | Handling |
//! |------|----------|----------|
//! | Connectivity | channel closed, broker unreachable | reconnect, fail all waiters |
//! | Correlation | timeout, cancellation, not delivered | typed result to the caller |
//! | Dispatch | handler fault | counted, reported, message still acked |
//! | Protocol | bad header, expired time slot | answered with a structured error |
//! | Configuration | invalid address, duplicate singleton | raised at the call site |
//! | Remote | error reported by the remote service | typed result to the caller |

use crate::correlation::CorrelationId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Coarse classification of a [`MessagingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broker unreachable or channel closed.
    Connectivity,
    /// Timeout, cancellation, non-delivery.
    Correlation,
    /// Failure while dispatching to a service.
    Dispatch,
    /// Malformed or rejected wire message.
    Protocol,
    /// Misuse detected at the call site.
    Configuration,
    /// Application error reported by the remote side.
    Remote,
}

/// Errors surfaced by messaging operations.
///
/// `Clone` so that a single failure (e.g. a disconnect) can resolve many
/// outstanding waiters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    /// The broker connection or channel went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A broker command failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// No reply arrived within the deadline.
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: CorrelationId,
        timeout_ms: u64,
    },

    /// The caller cancelled the wait.
    #[error("request {correlation_id} was cancelled")]
    Cancelled { correlation_id: CorrelationId },

    /// The broker returned the message as unroutable.
    #[error("message to {address} was not delivered")]
    NotDelivered { address: String },

    /// The serial executor shut down before running the operation.
    #[error("operation cancelled: executor shut down")]
    ExecutorShutdown,

    /// The remote service reported an error.
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    /// Wire-level protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid use of the API.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A filter or handler failed while dispatching.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The node has been disposed.
    #[error("node disposed")]
    Disposed,
}

impl MessagingError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionLost(_) | Self::Broker(_) | Self::ExecutorShutdown | Self::Disposed => {
                ErrorKind::Connectivity
            }
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::NotDelivered { .. } => {
                ErrorKind::Correlation
            }
            Self::Dispatch(_) | Self::Serialization(_) => ErrorKind::Dispatch,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Remote { .. } => ErrorKind::Remote,
        }
    }

    /// Shorthand for building a remote error.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True for cancellations.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True for broker returns.
    pub fn is_not_delivered(&self) -> bool {
        matches!(self, Self::NotDelivered { .. })
    }
}

/// Machine-readable protocol error codes, carried on the wire as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorCode {
    /// Header missing or unparseable.
    BadHeader,
    /// Header version is not supported.
    UnsupportedVersion,
    /// Message type is unknown or not valid here.
    BadMessageType,
    /// Body could not be decoded.
    BadPayload,
    /// The message's time slot has expired beyond tolerance.
    TimeSlotExpired,
    /// Ciphertext failed authentication.
    DecryptionFailed,
    /// Certificate failed validation.
    CertificateInvalid,
    /// Certificate does not authorize the requested service.
    Unauthorized,
    /// Key exchange could not be completed.
    KeyExchangeFailed,
    /// The service only accepts encrypted requests.
    SecureRequired,
}

impl ProtocolErrorCode {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadHeader => "BadHeader",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::BadMessageType => "BadMessageType",
            Self::BadPayload => "BadPayload",
            Self::TimeSlotExpired => "TimeSlotExpired",
            Self::DecryptionFailed => "DecryptionFailed",
            Self::CertificateInvalid => "CertificateInvalid",
            Self::Unauthorized => "Unauthorized",
            Self::KeyExchangeFailed => "KeyExchangeFailed",
            Self::SecureRequired => "SecureRequired",
        }
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BadHeader" => Self::BadHeader,
            "UnsupportedVersion" => Self::UnsupportedVersion,
            "BadMessageType" => Self::BadMessageType,
            "BadPayload" => Self::BadPayload,
            "TimeSlotExpired" => Self::TimeSlotExpired,
            "DecryptionFailed" => Self::DecryptionFailed,
            "CertificateInvalid" => Self::CertificateInvalid,
            "Unauthorized" => Self::Unauthorized,
            "KeyExchangeFailed" => Self::KeyExchangeFailed,
            "SecureRequired" => Self::SecureRequired,
            _ => return Err(()),
        })
    }
}

/// Structured protocol failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("protocol error {code}: {message}")]
pub struct ProtocolError {
    /// Machine-readable code.
    pub code: ProtocolErrorCode,
    /// Human-readable detail. Never contains key material.
    pub message: String,
}

impl ProtocolError {
    /// Create a protocol error.
    pub fn new(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors raised synchronously by the call that caused them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Address text is not `namespace:key`.
    #[error("invalid address format: '{0}'")]
    InvalidAddress(String),

    /// A singleton service already has a consumer somewhere in the system.
    #[error("singleton service {0} is already attached")]
    DuplicateSingleton(String),

    /// This node already hosts a service at the address.
    #[error("service {0} is already attached to this node")]
    AlreadyAttached(String),

    /// No service is attached at the address.
    #[error("no service attached at {0}")]
    NotAttached(String),

    /// Secure operation requested but the node has no secure client.
    #[error("secure channel is not configured")]
    SecureChannelDisabled,

    /// A setting is out of range or malformed.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}
