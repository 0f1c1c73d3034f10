//! # Table-Driven RPC
//!
//! Typed calls on top of [`Node::ask`](crate::Node::ask). A request names an
//! interface and an operation; the serving side looks the pair up in an
//! operation table.
//!
//! ```text
//!  RpcClient::call("Calculator", "add", &(2, 3))
//!      │  x-rpc: v=1;s=json;t=single
//!      │  body:  {"interface":"Calculator","operation":"add","arguments":[2,3]}
//!      ▼
//!  RpcBehavior ── table[("Calculator","add")] ──► handler(args, envelope)
//!      │
//!      └─► reply body 5, or x-error: OperationNotFound;Calculator.add
//! ```
//!
//! ## Error Replies
//!
//! | Code | Cause |
//! |------|-------|
//! | `BadHeader` / `UnsupportedVersion` | `x-rpc` missing or malformed |
//! | `BatchUnsupported` | `t=batch` |
//! | `BadPayload` | body or arguments do not decode |
//! | `OperationNotFound` | no table entry |
//! | `OperationFailed` | the handler returned an error |

mod behavior;
mod client;
mod serializer;

pub use behavior::RpcBehavior;
pub use client::RpcClient;
pub use serializer::{JsonSerializer, RpcRequest, RpcSerializer, SerializerRegistry, JSON_SERIALIZER};

/// No handler is registered for the interface/operation pair.
pub const OPERATION_NOT_FOUND: &str = "OperationNotFound";
/// Batched calls are not served.
pub const BATCH_UNSUPPORTED: &str = "BatchUnsupported";
/// The handler ran and failed.
pub const OPERATION_FAILED: &str = "OperationFailed";
