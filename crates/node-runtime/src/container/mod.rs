//! # Node Container
//!
//! Configuration and the broker link a node runs on.
//!
//! ```text
//! ┌───────────────────────── Link (one per channel generation) ──┐
//! │  BrokerChannel ◄── SerialExecutor ◄── every channel command   │
//! │       │                                                       │
//! │       └── private reply queue (exclusive, auto-delete, TTL)   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub(crate) mod link;

pub use config::NodeConfig;
