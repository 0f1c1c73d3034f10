//! # Wire Header Conventions
//!
//! | Header | Format | Purpose |
//! |--------|--------|---------|
//! | `x-rpc` | `v=1;s=<serializer>;t=<single\|batch>` | RPC payload description |
//! | `x-rpc-sec` | `v=1;t=<message type>` | secure channel message type |
//! | `x-error` | `<code>;<message>` | application error in a reply |
//!
//! Keys may appear in any order; unknown keys are ignored.

use crate::errors::{ProtocolError, ProtocolErrorCode};
use std::fmt;

/// Header carrying the RPC description.
pub const RPC_HEADER: &str = "x-rpc";
/// Header carrying the secure channel message type.
pub const SECURE_HEADER: &str = "x-rpc-sec";
/// Header carrying a remote error.
pub const ERROR_HEADER: &str = "x-error";

/// Only protocol version understood by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

fn parse_pairs(value: &str) -> Result<Vec<(&str, &str)>, ProtocolError> {
    value
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| {
                    ProtocolError::new(
                        ProtocolErrorCode::BadHeader,
                        format!("malformed header segment '{}'", part),
                    )
                })
        })
        .collect()
}

fn parse_version(pairs: &[(&str, &str)]) -> Result<u32, ProtocolError> {
    let raw = pairs
        .iter()
        .find(|(k, _)| *k == "v")
        .map(|(_, v)| *v)
        .ok_or_else(|| ProtocolError::new(ProtocolErrorCode::BadHeader, "missing version"))?;
    let version: u32 = raw.parse().map_err(|_| {
        ProtocolError::new(
            ProtocolErrorCode::BadHeader,
            format!("version '{}' is not a number", raw),
        )
    })?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::new(
            ProtocolErrorCode::UnsupportedVersion,
            format!("version {} is not supported", version),
        ));
    }
    Ok(version)
}

fn lookup<'a>(pairs: &[(&str, &'a str)], key: &str) -> Result<&'a str, ProtocolError> {
    pairs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            ProtocolError::new(ProtocolErrorCode::BadHeader, format!("missing '{}'", key))
        })
}

// =============================================================================
// RPC HEADER
// =============================================================================

/// Whether an RPC payload holds one call or several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMessageKind {
    Single,
    Batch,
}

impl RpcMessageKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
        }
    }
}

/// Parsed `x-rpc` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub version: u32,
    /// Serializer token, e.g. `json`.
    pub serializer: String,
    pub kind: RpcMessageKind,
}

impl RpcHeader {
    /// Single-call header for the given serializer.
    pub fn single(serializer: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            serializer: serializer.into(),
            kind: RpcMessageKind::Single,
        }
    }

    /// Parse the header value.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let pairs = parse_pairs(value)?;
        let version = parse_version(&pairs)?;
        let serializer = lookup(&pairs, "s")?;
        if serializer.is_empty() {
            return Err(ProtocolError::new(
                ProtocolErrorCode::BadHeader,
                "empty serializer",
            ));
        }
        let kind = match lookup(&pairs, "t")? {
            "single" => RpcMessageKind::Single,
            "batch" => RpcMessageKind::Batch,
            other => {
                return Err(ProtocolError::new(
                    ProtocolErrorCode::BadMessageType,
                    format!("unknown rpc type '{}'", other),
                ))
            }
        };
        Ok(Self {
            version,
            serializer: serializer.to_string(),
            kind,
        })
    }
}

impl fmt::Display for RpcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v={};s={};t={}",
            self.version,
            self.serializer,
            self.kind.as_str()
        )
    }
}

// =============================================================================
// SECURE HEADER
// =============================================================================

/// Secure channel message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureMessageType {
    RequestCertificate,
    RespondCertificate,
    RequestKey,
    RespondKey,
    RequestMessage,
    RespondMessage,
    Error,
}

impl SecureMessageType {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestCertificate => "requestcertificate",
            Self::RespondCertificate => "respondcertificate",
            Self::RequestKey => "requestkey",
            Self::RespondKey => "respondkey",
            Self::RequestMessage => "requestmessage",
            Self::RespondMessage => "respondmessage",
            Self::Error => "error",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        Some(match value {
            "requestcertificate" => Self::RequestCertificate,
            "respondcertificate" => Self::RespondCertificate,
            "requestkey" => Self::RequestKey,
            "respondkey" => Self::RespondKey,
            "requestmessage" => Self::RequestMessage,
            "respondmessage" => Self::RespondMessage,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Parsed `x-rpc-sec` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureHeader {
    pub version: u32,
    pub message_type: SecureMessageType,
}

impl SecureHeader {
    pub fn new(message_type: SecureMessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
        }
    }

    /// Parse the header value.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let pairs = parse_pairs(value)?;
        let version = parse_version(&pairs)?;
        let raw = lookup(&pairs, "t")?;
        let message_type = SecureMessageType::from_wire(raw).ok_or_else(|| {
            ProtocolError::new(
                ProtocolErrorCode::BadMessageType,
                format!("unknown secure message type '{}'", raw),
            )
        })?;
        Ok(Self {
            version,
            message_type,
        })
    }
}

impl fmt::Display for SecureHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={};t={}", self.version, self.message_type.as_str())
    }
}
