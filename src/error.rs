use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::wire::RequestId;

/// The JSON-RPC 2.0 error code carried on the wire inside an `ErrorResponse`.
///
/// Kept distinct from [`McpError`] so callers can match on the engine-local
/// outcomes (`Timeout`, `Cancelled`, ...) without also handling raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonRpcErrorCode(pub i64);

impl JsonRpcErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// Non-standard, used for `notifications/cancelled`-triggered error replies.
    pub const REQUEST_CANCELLED: Self = Self(-32800);
}

impl std::fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("malformed JSON-RPC message: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("local programming error: {method} requires capability `{capability}` the peer did not advertise")]
    Capability { method: String, capability: String },

    #[error("request {0:?} timed out after {1:?}")]
    Timeout(RequestId, Duration),

    #[error("request {0:?} was cancelled: {1}")]
    Cancelled(RequestId, String),

    #[error("transport disconnected")]
    Disconnected,

    #[error("peer returned unsupported protocol version `{0}`")]
    VersionUnsupported(String),

    #[error("duplicate request id {0:?} is already registered")]
    DuplicateId(RequestId),

    #[error("duplicate handler registered for method `{0}`")]
    DuplicateHandler(String),

    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl McpError {
    /// Maps this error to the wire code used when replying to an inbound request.
    ///
    /// Only meaningful for the variants a dispatcher can actually emit as an
    /// `ErrorResponse`; engine-local outcomes (`Capability`, `Timeout`, ...)
    /// never cross the wire and have no defined mapping.
    pub fn wire_code(&self) -> JsonRpcErrorCode {
        match self {
            McpError::Parse(_) => JsonRpcErrorCode::PARSE_ERROR,
            McpError::InvalidRequest(_) => JsonRpcErrorCode::INVALID_REQUEST,
            McpError::MethodNotFound(_) => JsonRpcErrorCode::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => JsonRpcErrorCode::INVALID_PARAMS,
            _ => JsonRpcErrorCode::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
