//! Secure-channel transport over the node's request/reply pipeline.

use crate::node::{AskOptions, Node};
use async_trait::async_trait;
use mb_04_secure_channel::SecureTransport;
use shared_types::{Envelope, Headers, MessagingError, ServiceAddress};
use std::sync::Weak;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Carries handshake and encrypted frames as ordinary asks.
///
/// Addresses arriving here are already translated.
pub(crate) struct NodeTransport {
    node: Weak<Node>,
}

impl NodeTransport {
    pub(crate) fn new(node: Weak<Node>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl SecureTransport for NodeTransport {
    async fn exchange(
        &self,
        address: &ServiceAddress,
        headers: Headers,
        body: Vec<u8>,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Envelope, MessagingError> {
        let node = self.node.upgrade().ok_or(MessagingError::Disposed)?;
        let options = AskOptions {
            timeout,
            headers,
            cancel,
        };
        node.ask_translated(address, body, options).await
    }
}
