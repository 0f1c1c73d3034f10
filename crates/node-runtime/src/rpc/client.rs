//! Calling side of table-driven RPC.

use super::{RpcRequest, RpcSerializer};
use crate::node::{AskOptions, Node};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::{ConfigurationError, Headers, MessagingError, RpcHeader, ServiceAddress, RPC_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed calls to one interface at one address.
#[derive(Clone)]
pub struct RpcClient {
    node: Arc<Node>,
    address: ServiceAddress,
    interface: String,
    serializer: Arc<dyn RpcSerializer>,
    secure: bool,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Client using the node's default serializer.
    pub fn new(node: Arc<Node>, address: ServiceAddress, interface: impl Into<String>) -> Self {
        let serializer = node.serializers().default_serializer();
        Self {
            node,
            address,
            interface: interface.into(),
            serializer,
            secure: false,
            timeout: None,
        }
    }

    /// Use a serializer registered with the node.
    ///
    /// # Errors
    ///
    /// `InvalidSetting` if no serializer has that name.
    pub fn with_serializer(mut self, name: &str) -> Result<Self, ConfigurationError> {
        self.serializer = self.node.serializers().get(name).ok_or_else(|| {
            ConfigurationError::InvalidSetting(format!("unknown serializer '{}'", name))
        })?;
        Ok(self)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Route calls through the secure channel.
    #[must_use]
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    #[must_use]
    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn encode<A: Serialize>(&self, operation: &str, args: &A) -> Result<(Vec<u8>, Headers), MessagingError> {
        let arguments = serde_json::to_value(args)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        let body = self.serializer.encode_request(&RpcRequest {
            interface: self.interface.clone(),
            operation: operation.to_string(),
            arguments,
        })?;
        let mut headers = Headers::new();
        headers.insert(
            RPC_HEADER.to_string(),
            RpcHeader::single(self.serializer.name()).to_string(),
        );
        Ok((body, headers))
    }

    /// Invoke `operation` and decode its result.
    ///
    /// # Errors
    ///
    /// Everything [`Node::ask`] can return; `Remote` with `OperationNotFound`
    /// or `OperationFailed` from the server; `Serialization` when the result
    /// does not decode into `R`.
    pub async fn call<A, R>(&self, operation: &str, args: &A) -> Result<R, MessagingError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let (body, headers) = self.encode(operation, args)?;
        let options = AskOptions {
            timeout: self.timeout,
            headers,
            cancel: None,
        };
        debug!(
            address = %self.address,
            interface = %self.interface,
            operation,
            secure = self.secure,
            "RPC call"
        );
        let reply = if self.secure {
            self.node.ask_secure(&self.address, body, options).await?
        } else {
            self.node.ask(&self.address, body, options).await?
        };

        let value = self.serializer.decode_value(&reply.body)?;
        serde_json::from_value(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    /// Invoke `operation` without waiting for a result.
    ///
    /// Secure clients still wait for the encrypted acknowledgment, since the
    /// channel only carries request/reply traffic.
    ///
    /// # Errors
    ///
    /// Local publish failures.
    pub async fn notify<A: Serialize>(&self, operation: &str, args: &A) -> Result<(), MessagingError> {
        let (body, headers) = self.encode(operation, args)?;
        if self.secure {
            let options = AskOptions {
                timeout: self.timeout,
                headers,
                cancel: None,
            };
            self.node.ask_secure(&self.address, body, options).await?;
            return Ok(());
        }
        self.node.send(&self.address, body, headers).await
    }
}
