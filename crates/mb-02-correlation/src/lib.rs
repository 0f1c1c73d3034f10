//! # Correlation Subsystem
//!
//! **Subsystem ID:** 2
//!
//! ## Purpose
//!
//! Matches replies to the requests that caused them. Every request with a
//! reply registers a waiter under a fresh [`CorrelationId`] *before* the
//! request is published; the reply listener, the broker-return pump and the
//! connection supervisor then race to resolve it.
//!
//! ```text
//!                      register_single / register_multi
//!  Node::ask ─────────────────────┐
//!                                 ▼
//!                   ┌──────────────────────────┐
//!  ReplyListener ──►│  DashMap<CorrelationId,  │◄── mark_undelivered (basic.return)
//!     resolve       │          Waiter>         │◄── fail_all (connection lost)
//!                   └──────────────────────────┘
//!                                 │
//!                                 ▼
//!              await_single / await_multi (timeout, cancel)
//! ```
//!
//! ## Resolution Rules
//!
//! | Event | Single waiter | Multi waiter |
//! |-------|---------------|--------------|
//! | Reply | completes, removed | appended, kept |
//! | Broker return | `NotDelivered`, removed | ignored |
//! | Timeout | `Timeout`, removed | window closes, partial result |
//! | Cancel | `Cancelled`, removed | window closes, partial result |
//! | Connection lost | `ConnectionLost`, removed | `ConnectionLost`, removed |
//!
//! A waiter is resolved at most once: the resolver that removes the map entry
//! wins and everyone else observes an absent entry.
//!
//! [`CorrelationId`]: shared_types::CorrelationId

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod listener;
pub mod registry;

pub use listener::{ListenerEvent, ReplyListener, UnroutableReason};
pub use registry::{CorrelationRegistry, MultiHandle, RegistryStats, SingleHandle};
