//! # Shared Bus - Broker Transport
//!
//! The ports a Meshbus node uses to talk to a message broker, plus an
//! in-memory broker that implements them.
//!
//! ## Model
//!
//! ```text
//!  publish(exchange, routing_key) ──► Exchange ──bindings──► Queue ──► Consumer
//!         │                                                  │
//!         └── mandatory & unroutable ──► ChannelEvent::Returned
//! ```
//!
//! - Channels are not safe for concurrent command streams; callers serialize
//!   access (see the serial executor).
//! - Deliveries are acknowledged per channel by delivery tag. Closing a
//!   channel requeues its unacknowledged deliveries as redelivered.
//! - Channel lifecycle is reported on a per-channel event stream.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod memory;
pub mod routing;
pub mod subscriber;
pub mod transport;

pub use memory::{InMemoryBroker, QueueInfo};
pub use routing::topic_matches;
pub use subscriber::{Consumer, ConsumerClosed, DeliveryStream};
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelEvent, Delivery, ExchangeKind,
    MessageProperties, QueueOptions, ReturnedMessage,
};

/// The default exchange: routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";
