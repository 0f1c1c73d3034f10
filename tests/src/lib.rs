//! # Meshbus Test Suite
//!
//! Cross-crate scenarios run against the in-process broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs       # Broker, node and behavior helpers
//!     ├── request_reply.rs  # ask / send, correlation, timeouts, translation
//!     ├── delivery.rs       # balanced, fanout, singleton, broadcast, events
//!     ├── concurrency.rs    # serial vs parallel services
//!     ├── recovery.rs       # disconnect, reconnect, teardown, dispose
//!     └── secure_rpc.rs     # secure channel and table-driven RPC
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p mb-tests
//! cargo test -p mb-tests integration::recovery::
//! ```

#![allow(dead_code)]

pub mod integration;
