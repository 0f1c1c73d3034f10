//! # Adapter Implementations
//!
//! Node-side implementations of the ports the messaging crates define.
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────┐
//! │ Port (crate)                 │ Adapter                              │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │ ReplySink (shared-types)     │ NodeReplySink → default exchange     │
//! │ SecureTransport (mb-04)      │ NodeTransport → Node::ask pipeline   │
//! └──────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Both hold a `Weak<Node>` so a dropped node is not kept alive by
//! in-flight handlers.

pub(crate) mod reply_sink;
pub(crate) mod transport;

pub(crate) use reply_sink::NodeReplySink;
pub(crate) use transport::NodeTransport;
