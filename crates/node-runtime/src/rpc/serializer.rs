//! RPC payload serializers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::MessagingError;
use std::collections::HashMap;
use std::sync::Arc;

/// Serializer token for [`JsonSerializer`].
pub const JSON_SERIALIZER: &str = "json";

/// One call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub interface: String,
    pub operation: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Converts requests and results to and from message bodies.
///
/// The `name` is carried in the `s=` field of the `x-rpc` header.
pub trait RpcSerializer: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// `Serialization` when the request cannot be encoded.
    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>, MessagingError>;

    /// # Errors
    ///
    /// `Serialization` for an undecodable body.
    fn decode_request(&self, body: &[u8]) -> Result<RpcRequest, MessagingError>;

    /// # Errors
    ///
    /// `Serialization` when the value cannot be encoded.
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, MessagingError>;

    /// # Errors
    ///
    /// `Serialization` for an undecodable body.
    fn decode_value(&self, body: &[u8]) -> Result<Value, MessagingError>;
}

fn serialization(err: serde_json::Error) -> MessagingError {
    MessagingError::Serialization(err.to_string())
}

/// UTF-8 JSON bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl RpcSerializer for JsonSerializer {
    fn name(&self) -> &str {
        JSON_SERIALIZER
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(request).map_err(serialization)
    }

    fn decode_request(&self, body: &[u8]) -> Result<RpcRequest, MessagingError> {
        serde_json::from_slice(body).map_err(serialization)
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(value).map_err(serialization)
    }

    fn decode_value(&self, body: &[u8]) -> Result<Value, MessagingError> {
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(body).map_err(serialization)
    }
}

/// Serializers by name. One registry per node; `json` is always present.
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<String, Arc<dyn RpcSerializer>>>,
    default_name: String,
}

impl SerializerRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut serializers: HashMap<String, Arc<dyn RpcSerializer>> = HashMap::new();
        serializers.insert(JSON_SERIALIZER.to_string(), Arc::new(JsonSerializer));
        Self {
            serializers: RwLock::new(serializers),
            default_name: JSON_SERIALIZER.to_string(),
        }
    }

    /// Add or replace a serializer under its own name.
    pub fn register(&self, serializer: Arc<dyn RpcSerializer>) {
        self.serializers
            .write()
            .insert(serializer.name().to_string(), serializer);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcSerializer>> {
        self.serializers.read().get(name).cloned()
    }

    /// The serializer clients use unless told otherwise.
    #[must_use]
    pub fn default_serializer(&self) -> Arc<dyn RpcSerializer> {
        self.get(&self.default_name)
            .unwrap_or_else(|| Arc::new(JsonSerializer))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.serializers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
