//! Channel event pump and reconnect supervision.
//!
//! ```text
//!  ChannelEvent::Returned ──► registry.mark_undelivered
//!  ChannelEvent::Shutdown ──► barrier up, fail waiters
//!                               │
//!                               ├─ rebuild ok ──► barrier down, Reconnected
//!                               └─ N failures ──► dispose, Faulted
//! ```

use super::{Node, NodeEvent};
use shared_bus::ChannelEvent;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches one node's channel events for its whole life.
pub(crate) struct ReconnectSupervisor {
    node: Weak<Node>,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub(crate) fn spawn(
        node: Weak<Node>,
        shutdown: CancellationToken,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let supervisor = Self { node, shutdown };
        tokio::spawn(supervisor.run(events))
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            // The channel closed without a shutdown event: a local close.
            let Some(event) = event else { break };
            let Some(node) = self.node.upgrade() else { break };

            match event {
                ChannelEvent::Returned(returned) => node.handle_return(returned),
                ChannelEvent::Shutdown { reason } => match self.recover(&node, &reason).await {
                    Some(next) => events = next,
                    None => break,
                },
            }
        }
        debug!("Reconnect supervisor stopped");
    }

    /// Rebuild the channel, or tear the node down after the last attempt.
    async fn recover(
        &self,
        node: &Arc<Node>,
        reason: &str,
    ) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        if node.is_disposed() {
            return None;
        }
        node.begin_reconnect(reason);

        let attempts = node.config.reconnect_attempts;
        let delay = node.config.reconnect_delay;
        for attempt in 1..=attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match node.rebuild().await {
                Ok(events) => {
                    info!(node = %node.id, attempt, "Reconnected");
                    let _ = node.events.send(NodeEvent::Reconnected { attempts: attempt });
                    return Some(events);
                }
                Err(e) => {
                    warn!(node = %node.id, attempt, attempts, error = %e, "Reconnect attempt failed");
                    if node.is_disposed() {
                        return None;
                    }
                }
            }
        }

        error!(node = %node.id, attempts, reason, "Reconnect failed, disposing node");
        node.dispose().await;
        let _ = node.events.send(NodeEvent::Faulted {
            reason: format!("reconnect failed after {} attempts: {}", attempts, reason),
        });
        None
    }
}
