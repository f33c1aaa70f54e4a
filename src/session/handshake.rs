//! `initialize` request/result shapes and protocol version negotiation
//! (spec.md §4.1, §6). The version list supersedes the original SDK's
//! `Constants.h` list — spec.md §6 is the newer, authoritative source.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::capabilities::{ClientCapabilities, ServerCapabilities};
use crate::error::McpError;

/// Versions this engine speaks, newest first. The first entry is offered to
/// peers; `negotiate` walks this list looking for the first match with a
/// peer's requested version or its own offered list.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

pub const LATEST_VERSION: &str = SUPPORTED_VERSIONS[0];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "instructions")]
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Picks the version to run the session at, given what the peer requested.
///
/// If the requested version is one this engine supports, it is echoed back
/// unchanged (spec.md §6: "a server that supports the requested version MUST
/// respond with that same version"). Otherwise the engine falls back to its
/// own latest supported version — the peer is responsible for deciding
/// whether that is acceptable, by inspecting the result's `protocolVersion`.
pub fn negotiate(requested: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|&&v| v == requested)
        .copied()
        .unwrap_or(LATEST_VERSION)
}

/// Strict check used when a peer's final negotiated version must be one this
/// engine actually understands, e.g. validating the server's reply to our
/// own `initialize` request.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

pub fn require_supported(version: &str) -> Result<(), McpError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(McpError::VersionUnsupported(version.to_string()))
    }
}
