//! Serving side: an operation table behind [`ServiceBehavior`].

use super::{SerializerRegistry, BATCH_UNSUPPORTED, OPERATION_FAILED, OPERATION_NOT_FOUND};
use async_trait::async_trait;
use futures::future::BoxFuture;
use mb_03_service_dispatch::ServiceBehavior;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_types::{
    Envelope, Headers, ProtocolErrorCode, RpcHeader, RpcMessageKind, RPC_HEADER,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

enum HandlerError {
    /// Arguments did not decode into the handler's type.
    BadArguments(String),
    Failed(anyhow::Error),
}

type Handler = Arc<dyn Fn(Value, Envelope) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Dispatches RPC requests to handlers keyed by `(interface, operation)`.
///
/// ```rust,ignore
/// let behavior = RpcBehavior::new(node.serializers())
///     .operation("Calculator", "add", |(a, b): (i64, i64), _env| async move {
///         Ok::<_, anyhow::Error>(a + b)
///     });
/// node.attach(address, ServiceConfiguration::default(), Arc::new(behavior)).await?;
/// ```
pub struct RpcBehavior {
    operations: HashMap<(String, String), Handler>,
    serializers: Arc<SerializerRegistry>,
}

impl RpcBehavior {
    #[must_use]
    pub fn new(serializers: Arc<SerializerRegistry>) -> Self {
        Self {
            operations: HashMap::new(),
            serializers,
        }
    }

    /// Register a handler. A later registration for the same pair replaces
    /// the earlier one.
    #[must_use]
    pub fn operation<A, R, F, Fut>(mut self, interface: &str, operation: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |arguments: Value, envelope: Envelope| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = serde_json::from_value(arguments)
                    .map_err(|e| HandlerError::BadArguments(e.to_string()))?;
                let result = handler(args, envelope).await.map_err(HandlerError::Failed)?;
                serde_json::to_value(result).map_err(|e| HandlerError::Failed(e.into()))
            })
        });
        self.operations
            .insert((interface.to_string(), operation.to_string()), erased);
        self
    }

    /// Registered `(interface, operation)` pairs, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self.operations.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn reject(envelope: &Envelope, code: &str, message: &str) {
        warn!(
            correlation_id = %envelope.correlation_id,
            code,
            message,
            "Rejecting RPC request"
        );
        if !envelope.can_reply() {
            return;
        }
        if let Err(e) = envelope.reply_error(code, message).await {
            warn!(correlation_id = %envelope.correlation_id, error = %e, "Failed to send RPC error");
        }
    }
}

#[async_trait]
impl ServiceBehavior for RpcBehavior {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        let Some(value) = envelope.header(RPC_HEADER) else {
            Self::reject(&envelope, ProtocolErrorCode::BadHeader.as_str(), "missing x-rpc header").await;
            return Ok(());
        };
        let header = match RpcHeader::parse(value) {
            Ok(header) => header,
            Err(e) => {
                Self::reject(&envelope, e.code.as_str(), &e.message).await;
                return Ok(());
            }
        };
        if header.kind == RpcMessageKind::Batch {
            Self::reject(&envelope, BATCH_UNSUPPORTED, "batched calls are not supported").await;
            return Ok(());
        }
        let Some(serializer) = self.serializers.get(&header.serializer) else {
            let message = format!("unknown serializer '{}'", header.serializer);
            Self::reject(&envelope, ProtocolErrorCode::BadHeader.as_str(), &message).await;
            return Ok(());
        };
        let request = match serializer.decode_request(&envelope.body) {
            Ok(request) => request,
            Err(e) => {
                Self::reject(&envelope, ProtocolErrorCode::BadPayload.as_str(), &e.to_string()).await;
                return Ok(());
            }
        };

        let name = format!("{}.{}", request.interface, request.operation);
        let Some(handler) = self
            .operations
            .get(&(request.interface, request.operation))
            .cloned()
        else {
            Self::reject(&envelope, OPERATION_NOT_FOUND, &name).await;
            return Ok(());
        };

        debug!(correlation_id = %envelope.correlation_id, operation = %name, "Invoking RPC handler");
        match handler(request.arguments, envelope.clone()).await {
            Ok(result) => {
                if !envelope.can_reply() {
                    return Ok(());
                }
                let body = serializer.encode_value(&result)?;
                let mut headers = Headers::new();
                headers.insert(
                    RPC_HEADER.to_string(),
                    RpcHeader::single(serializer.name()).to_string(),
                );
                envelope.reply(body, headers).await?;
                Ok(())
            }
            Err(HandlerError::BadArguments(message)) => {
                Self::reject(&envelope, ProtocolErrorCode::BadPayload.as_str(), &message).await;
                Ok(())
            }
            Err(HandlerError::Failed(error)) => {
                Self::reject(&envelope, OPERATION_FAILED, &error.to_string()).await;
                Err(error.context(format!("operation {} failed", name)))
            }
        }
    }
}
