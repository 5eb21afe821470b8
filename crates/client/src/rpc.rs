// crates/client/src/rpc.rs
//! JSON-RPC 2.0 framing used on the job service WebSocket.

use serde::Deserialize;
use serde_json::{json, Value};

use jobwatch_core::TransportError;

/// Notification method carrying subscription events.
pub const COLLECTION_UPDATE: &str = "collection_update";

pub fn request(id: u64, method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// JSON-RPC requires positional or named params; `null` becomes `[]`.
pub fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => json!([]),
        Value::Array(_) | Value::Object(_) => params,
        other => json!([other]),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Added,
    Changed,
    Removed,
    #[serde(other)]
    Unknown,
}

/// `params` of a `collection_update` notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CollectionUpdate {
    pub collection: String,
    pub msg: UpdateKind,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub fields: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Reply {
        id: u64,
        result: Result<Value, TransportError>,
    },
    CollectionUpdate(CollectionUpdate),
    /// Any other notification, by method name.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl ErrorBody {
    /// Prefer the backend's own reason over the generic JSON-RPC message.
    fn into_error(self) -> TransportError {
        let reason = self
            .data
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        TransportError::Rpc {
            code: self.code,
            message: reason.unwrap_or(self.message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

pub fn parse_incoming(text: &str) -> Result<Incoming, TransportError> {
    let raw: RawMessage =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(format!("invalid JSON-RPC frame: {e}")))?;

    if let Some(method) = raw.method {
        if method != COLLECTION_UPDATE {
            return Ok(Incoming::Other(method));
        }
        let params = raw
            .params
            .ok_or_else(|| TransportError::Protocol("collection_update without params".into()))?;
        let update: CollectionUpdate = serde_json::from_value(params)
            .map_err(|e| TransportError::Protocol(format!("malformed collection_update: {e}")))?;
        return Ok(Incoming::CollectionUpdate(update));
    }

    let id = raw
        .id
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::Protocol("reply without a numeric id".into()))?;
    let result = match raw.error {
        Some(error) => Err(error.into_error()),
        None => Ok(raw.result.unwrap_or(Value::Null)),
    };
    Ok(Incoming::Reply { id, result })
}
