//! # Serial Executor Subsystem
//!
//! **Subsystem ID:** 1
//!
//! ## Purpose
//!
//! Broker channels are not safe for concurrent use. The serial executor turns
//! any number of concurrent callers into one ordered stream of channel
//! operations running on a dedicated worker thread.
//!
//! ```text
//! caller A ──enqueue──┐
//! caller B ──enqueue──┼──► [ FIFO ] ──► worker thread ──► channel.publish / ack / declare
//! caller C ──await────┘                      │
//!                                            └── result ──► caller C
//! ```
//!
//! ## Guarantees
//!
//! | Property | Enforcement |
//! |----------|-------------|
//! | Enqueue order is execution order | single FIFO, single worker |
//! | `enqueue_and_await` sees the operation's error | result sent back over a oneshot |
//! | Fire-and-forget failures are logged, not lost silently | `warn!` in the worker |
//! | Queued work is cancelled on shutdown | remaining jobs fail with `ExecutorShutdown` |
//! | A panicking operation does not kill the worker | `catch_unwind` per job |
//!
//! The worker only blocks while physically running an operation; waiting
//! callers suspend on a oneshot and never hold a lock across the await.

pub mod executor;
mod job;

pub use executor::{ExecutorStats, SerialExecutor};
