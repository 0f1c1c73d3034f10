//! Replies from services back to a caller's private queue.

use crate::node::Node;
use async_trait::async_trait;
use shared_types::{CorrelationId, Headers, MessagingError, ReplySink};
use std::sync::Weak;

/// Publishes replies through the owning node's current link.
pub(crate) struct NodeReplySink {
    node: Weak<Node>,
}

impl NodeReplySink {
    pub(crate) fn new(node: Weak<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ReplySink for NodeReplySink {
    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: CorrelationId,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), MessagingError> {
        let node = self.node.upgrade().ok_or(MessagingError::Disposed)?;
        node.publish_reply(reply_to, correlation_id, headers, body).await
    }
}
