//! # Meshbus Node Runtime
//!
//! Assembles the messaging crates into a [`Node`]: one application
//! instance with a broker channel, a correlation registry, attached
//! services and reconnect supervision. The `meshbus-node` binary in
//! `main.rs` runs a demonstration node.
//!
//! ## Modules
//!
//! - `container/` - configuration and the per-channel `Link`
//! - `wiring/` - exchange/queue topology per delivery type
//! - `adapters/` - reply sink and secure transport over the node
//! - `node/` - the node, its subscriptions and the reconnect supervisor
//! - `rpc/` - table-driven RPC client and behavior
//!
//! ## Operations
//!
//! | Operation | Waits for | Undeliverable |
//! |-----------|-----------|---------------|
//! | `ask` | one reply | `NotDelivered` |
//! | `broadcast` | replies until the window closes | skipped |
//! | `send` | nothing | dropped |
//! | `emit` | nothing | dropped |

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![allow(clippy::type_complexity)]

mod adapters;
pub mod container;
pub mod node;
pub mod rpc;
mod wiring;

pub use container::NodeConfig;
pub use node::{
    AskOptions, BroadcastOptions, EventStream, EventSubscription, Node, NodeEvent, NodeState,
};
pub use rpc::{
    JsonSerializer, RpcBehavior, RpcClient, RpcRequest, RpcSerializer, SerializerRegistry,
};
