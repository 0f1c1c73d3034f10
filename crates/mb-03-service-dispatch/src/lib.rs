//! # Service Dispatch Subsystem
//!
//! **Subsystem ID:** 3
//!
//! ## Purpose
//!
//! Runs every inbound message of an attached service through its pipeline:
//! ordered filter chain, concurrency gate, bound behavior, acknowledgment.
//!
//! ## Architecture
//!
//! ```text
//!   broker consumer ──► ServiceDispatcher::run
//!                            │  (Serial: inline, one at a time)
//!                            │  (Parallel: one task per message)
//!                            ▼
//!                  ┌───────────────────┐
//!                  │  filter chain     │── Stop ──┐
//!                  └───────────────────┘          │
//!                            ▼                    │
//!                  ┌───────────────────┐          │
//!                  │  Semaphore gate   │          │
//!                  └───────────────────┘          │
//!                            ▼                    │
//!                  ┌───────────────────┐          │
//!                  │  ServiceBehavior  │── Err/panic ──► ServiceEvent::UnhandledException
//!                  └───────────────────┘          │
//!                            ▼                    ▼
//!                       Acknowledger::ack (via the serial executor)
//! ```
//!
//! ## Guarantees
//!
//! | Property | Enforcement |
//! |----------|-------------|
//! | At most `max_concurrency` behaviors in flight | per-service `Semaphore`, permit dropped on every exit |
//! | `Serial` never overlaps, ack included | messages dispatched inline by the consume loop |
//! | Every message acked exactly once | ack after the pipeline, regardless of outcome |
//! | Behavior failures never reach the broker callback | behavior runs in its own task; errors and panics counted |
//!
//! Delivery semantics (`Balanced` / `Fanout` / `Singleton`) come from the
//! queue topology the node declares; the dispatcher consumes whatever
//! arrives on its queue.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod dispatcher;
pub mod ports;
pub mod service;

pub use dispatcher::ServiceDispatcher;
pub use ports::{
    Acknowledger, ExecutorAcknowledger, FilterDecision, FnBehavior, ServiceBehavior, ServiceFilter,
};
pub use service::{CounterSnapshot, Service, ServiceCounters, ServiceEvent};
