//! JSON-RPC 2.0 framing: the typed [`Message`] union and its (de)serialization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::McpError;

const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request/response id: either a string or an integer, never both
/// within the same id. Numeric ids are kept as `i64` so they never get
/// silently coerced to strings or floats on a round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// A JSON-RPC error object as carried inside [`Message::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The four JSON-RPC message shapes MCP uses over the wire.
///
/// Each variant carries `extra`: whatever top-level object keys the envelope
/// arrived with besides the ones this engine understands. Preserving them
/// lets a message decoded from a newer spec revision round-trip unchanged
/// through code that doesn't know what those keys mean (spec.md §4.1).
#[derive(Debug, Clone)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
        meta: Option<Value>,
        extra: Map<String, Value>,
    },
    Response {
        id: RequestId,
        result: Value,
        meta: Option<Value>,
        extra: Map<String, Value>,
    },
    Error {
        id: Option<RequestId>,
        error: ErrorObject,
        extra: Map<String, Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
        meta: Option<Value>,
        extra: Map<String, Value>,
    },
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response {
            id,
            result,
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Message::Error {
            id,
            error: ErrorObject {
                code,
                message: message.into(),
                data,
            },
            extra: Map::new(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Total: serializes to canonical (non-pretty) JSON bytes.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_value()).expect("Message serializes to a JSON object")
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        // Extra keys go in first so the fields this engine understands always
        // win if a key somehow collides.
        obj.extend(self.extra().clone());
        match self {
            Message::Request { id, method, params, meta, .. } => {
                obj.insert("id".into(), id_to_value(id));
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = attach_meta(params.clone(), meta) {
                    obj.insert("params".into(), params);
                }
            }
            Message::Response { id, result, meta, .. } => {
                obj.insert("id".into(), id_to_value(id));
                let mut result = result.clone();
                if let (Value::Object(result_obj), Some(meta)) = (&mut result, meta) {
                    result_obj.insert("_meta".into(), meta.clone());
                }
                obj.insert("result".into(), result);
            }
            Message::Error { id, error, .. } => {
                obj.insert(
                    "id".into(),
                    id.as_ref().map(id_to_value).unwrap_or(Value::Null),
                );
                obj.insert("error".into(), serde_json::to_value(error).unwrap());
            }
            Message::Notification { method, params, meta, .. } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = attach_meta(params.clone(), meta) {
                    obj.insert("params".into(), params);
                }
            }
        }
        Value::Object(obj)
    }

    /// The bag of top-level keys neither this engine nor the match above
    /// recognizes, carried so unrecognized future-spec keys round-trip.
    fn extra(&self) -> &Map<String, Value> {
        match self {
            Message::Request { extra, .. }
            | Message::Response { extra, .. }
            | Message::Notification { extra, .. } => extra,
            Message::Error { extra, .. } => extra,
        }
    }

    /// Classifies and decodes a raw JSON value per spec.md §4.1.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Message, McpError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| McpError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> std::result::Result<Message, McpError> {
        let obj = value
            .as_object()
            .ok_or_else(|| McpError::Parse("message is not a JSON object".into()))?;

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(McpError::Parse("missing or invalid \"jsonrpc\" field".into())),
        }

        let has_id = obj.contains_key("id");
        let has_method = obj.contains_key("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        let mut extra = obj.clone();
        for key in ["jsonrpc", "id", "method", "params", "result", "error"] {
            extra.remove(key);
        }

        if has_method && has_id {
            let id = parse_id(obj.get("id"))?.ok_or_else(|| {
                McpError::Parse("request id must not be null".into())
            })?;
            let method = parse_method(obj)?;
            let (params, meta) = split_meta(obj.get("params").cloned());
            Ok(Message::Request { id, method, params, meta, extra })
        } else if has_method && !has_id {
            let method = parse_method(obj)?;
            let (params, meta) = split_meta(obj.get("params").cloned());
            Ok(Message::Notification { method, params, meta, extra })
        } else if has_id && has_result && !has_method && !has_error {
            let id = parse_id(obj.get("id"))?
                .ok_or_else(|| McpError::Parse("response id must not be null".into()))?;
            let mut result = obj.get("result").cloned().unwrap_or(Value::Null);
            let meta = if let Value::Object(result_obj) = &mut result {
                result_obj.remove("_meta")
            } else {
                None
            };
            Ok(Message::Response { id, result, meta, extra })
        } else if has_id && has_error && !has_method && !has_result {
            let id = parse_id(obj.get("id"))?;
            let error: ErrorObject = serde_json::from_value(
                obj.get("error").cloned().ok_or_else(|| {
                    McpError::Parse("error response missing \"error\" object".into())
                })?,
            )
            .map_err(|e| McpError::Parse(format!("invalid error object: {e}")))?;
            Ok(Message::Error { id, error, extra })
        } else {
            Err(McpError::Parse(
                "message does not match any of request/response/error/notification".into(),
            ))
        }
    }
}

fn parse_method(obj: &Map<String, Value>) -> std::result::Result<String, McpError> {
    obj.get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| McpError::Parse("\"method\" must be a string".into()))
}

fn parse_id(raw: Option<&Value>) -> std::result::Result<Option<RequestId>, McpError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s.clone()))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| McpError::Parse("request id out of i64 range".into())),
        Some(_) => Err(McpError::Parse("request id must be a string or integer".into())),
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::Number((*n).into()),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

/// Pulls `_meta` out of a `params` object so it travels alongside the message
/// instead of inside the typed params payload.
fn split_meta(params: Option<Value>) -> (Option<Value>, Option<Value>) {
    match params {
        Some(Value::Object(mut obj)) => {
            let meta = obj.remove("_meta");
            let params = if obj.is_empty() && meta.is_some() {
                None
            } else {
                Some(Value::Object(obj))
            };
            (params, meta)
        }
        other => (other, None),
    }
}

fn attach_meta(params: Option<Value>, meta: &Option<Value>) -> Option<Value> {
    match (params, meta) {
        (Some(Value::Object(mut obj)), Some(meta)) => {
            obj.insert("_meta".into(), meta.clone());
            Some(Value::Object(obj))
        }
        (None, Some(meta)) => {
            let mut obj = Map::new();
            obj.insert("_meta".into(), meta.clone());
            Some(Value::Object(obj))
        }
        (params, None) => params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_request_with_integer_id() {
        let msg = Message::request(RequestId::Number(7), "tools/call", Some(json!({"a": 1})));
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded {
            Message::Request { id, method, params, .. } => {
                assert_eq!(id, RequestId::Number(7));
                assert_eq!(method, "tools/call");
                assert_eq!(params, Some(json!({"a": 1})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trips_request_with_string_id_and_meta() {
        let mut msg = Message::request(
            RequestId::String("abc".into()),
            "tools/call",
            Some(json!({"a": 1})),
        );
        if let Message::Request { meta, .. } = &mut msg {
            *meta = Some(json!({"progressToken": "p1"}));
        }
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded {
            Message::Request { id, meta, .. } => {
                assert_eq!(id, RequestId::String("abc".into()));
                assert_eq!(meta, Some(json!({"progressToken": "p1"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let msg = Message::notification("notifications/initialized", None);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert!(matches!(decoded, Message::Notification { .. }));
    }

    #[test]
    fn classifies_error_response_with_null_id() {
        let bytes = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "parse error"}
        })
        .to_string();
        let decoded = Message::decode(bytes.as_bytes()).unwrap();
        match decoded {
            Message::Error { id, error, .. } => {
                assert_eq!(id, None);
                assert_eq!(error.code, -32700);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_jsonrpc_field() {
        let bytes = json!({"id": 1, "method": "ping"}).to_string();
        assert!(Message::decode(bytes.as_bytes()).is_err());
    }

    #[test]
    fn rejects_ambiguous_shape() {
        let bytes = json!({"jsonrpc": "2.0", "id": 1}).to_string();
        assert!(Message::decode(bytes.as_bytes()).is_err());
    }

    #[test]
    fn preserves_numeric_id_type_not_as_string() {
        let msg = Message::response(RequestId::Number(42), json!({"ok": true}));
        let bytes = msg.encode();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["id"].is_number());
    }

    #[test]
    fn unknown_top_level_keys_round_trip() {
        let bytes = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"a": 1},
            "traceId": "abc123"
        })
        .to_string();
        let decoded = Message::decode(bytes.as_bytes()).unwrap();
        match &decoded {
            Message::Request { extra, .. } => {
                assert_eq!(extra.get("traceId"), Some(&json!("abc123")));
            }
            other => panic!("unexpected {other:?}"),
        }
        let re_encoded: Value = serde_json::from_slice(&decoded.encode()).unwrap();
        assert_eq!(re_encoded["traceId"], json!("abc123"));
    }
}
