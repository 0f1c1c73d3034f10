//! # Broker Topology
//!
//! Maps service addresses and delivery types onto exchanges, queues and
//! bindings.
//!
//! ```text
//!  ask/send/emit("billing:invoice.create")
//!          │
//!          ▼
//!  ┌──────────────────┐  routing key = address key
//!  │ topic exchange   │──────────────────────────────┐
//!  │ "billing"        │                              │
//!  └──────────────────┘                              ▼
//!     Balanced   → queue "billing:invoice.create" (shared, competing)
//!     Fanout     → queue "billing:invoice.create%<node>" (one per node)
//!     Singleton  → queue "billing:invoice.create" (exclusive consumer)
//!     Subscribe  → server-named queue bound with the pattern
//! ```

pub(crate) mod topology;
