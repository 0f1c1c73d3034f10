//! Node lifecycle state and owner-facing notifications.

use mb_02_correlation::UnroutableReason;
use shared_types::{CorrelationId, ServiceAddress};

/// Where the node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Channel open; requests flow.
    Running,
    /// Channel lost; new requests wait for the rebuild.
    Reconnecting,
    /// Terminal. Every operation fails with `Disposed`.
    Disposed,
}

/// Notifications raised to the node owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A reply arrived that no waiter claimed.
    UnroutableReply {
        correlation_id: Option<CorrelationId>,
        reason: UnroutableReason,
    },
    /// A service behavior or filter failed on a message.
    UnhandledException {
        address: ServiceAddress,
        correlation_id: CorrelationId,
        error: String,
    },
    /// The channel shut down; pending requests have been failed.
    Disconnected { reason: String },
    /// The channel was rebuilt and services re-attached.
    Reconnected { attempts: u32 },
    /// Recovery gave up and the node disposed itself.
    Faulted { reason: String },
}
