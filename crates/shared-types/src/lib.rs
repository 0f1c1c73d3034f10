//! # Shared Types Crate
//!
//! This crate contains the message envelope, correlation identifiers, service
//! addresses, wire header conventions and the error taxonomy used by every
//! Meshbus crate.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-crate types are defined here.
//! - **Explicit Context**: Handlers receive the inbound [`Envelope`] as an
//!   argument; there is no ambient "current message".
//! - **Typed Outcomes**: Timeouts, cancellations and non-delivery are values of
//!   [`MessagingError`], distinguished by [`ErrorKind`].

pub mod address;
pub mod correlation;
pub mod envelope;
pub mod errors;
pub mod headers;
pub mod service;

pub use address::{ServiceAddress, TranslationRule};
pub use correlation::CorrelationId;
pub use envelope::{DeliveryInfo, Envelope, Headers, ReplySink};
pub use errors::*;
pub use headers::{
    RpcHeader, RpcMessageKind, SecureHeader, SecureMessageType, ERROR_HEADER, PROTOCOL_VERSION,
    RPC_HEADER, SECURE_HEADER,
};
pub use service::{
    DeliveryType, ExecutionMode, ServiceConfiguration, ServiceConfigurationBuilder,
    DEFAULT_MAX_CONCURRENCY,
};
