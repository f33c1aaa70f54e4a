//! High-level client facade: wires a `Session` to a `Transport`, drives the
//! handshake, and exposes typed wrappers over the C→S methods (spec.md §6).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::content::{CallToolResult, PromptMessage, ResourceContents};
use crate::dispatcher::BoxFuture;
use crate::error::McpError;
use crate::methods;
use crate::registry::{PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor};
use crate::session::capabilities::ClientCapabilities;
use crate::session::handshake::{Implementation, InitializeResult};
use crate::session::{Session, SessionState};
use crate::transport::Transport;
use crate::wire::RequestId;

/// A server-initiated `sampling/createMessage` or `elicitation/create`
/// request, answered by the embedding application rather than the engine
/// itself (spec.md §6: both cross from server to client).
pub type PeerRequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<PromptDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResourceTemplatesResult {
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// Capped at 100 values per spec.md §6.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResult {
    pub values: Vec<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default, rename = "hasMore")]
    pub has_more: Option<bool>,
}

/// An MCP client connection: the `Session` plus the background task driving
/// its read loop.
pub struct Client {
    session: Arc<Session>,
    run_handle: JoinHandle<Result<(), McpError>>,
}

impl Client {
    /// Connects over `transport`, runs the handshake to completion, and
    /// returns once the session is `Operational`.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        implementation: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<(Self, InitializeResult), McpError> {
        let session = Session::new_client(transport, implementation, capabilities);
        register_roots_handler(&session).await?;
        let run_handle = tokio::spawn(session.clone().run());
        let result = session.client_handshake().await?;
        Ok((Self { session, run_handle }, result))
    }

    /// Answers the server's `sampling/createMessage` requests with `handler`.
    /// Only meaningful when the advertised `ClientCapabilities` include
    /// `sampling`; the server checks that before ever sending one.
    pub async fn set_sampling_handler(&self, handler: PeerRequestHandler) -> Result<(), McpError> {
        register_peer_request_handler(&self.session, methods::SAMPLING_CREATE_MESSAGE, handler).await
    }

    /// Answers the server's `elicitation/create` requests with `handler`.
    pub async fn set_elicitation_handler(&self, handler: PeerRequestHandler) -> Result<(), McpError> {
        register_peer_request_handler(&self.session, methods::ELICITATION_CREATE, handler).await
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Replaces the full set of roots this client exposes to `roots/list`,
    /// broadcasting `notifications/roots/list_changed` if advertised
    /// (spec.md §4.6).
    pub async fn set_roots(&self, roots: Vec<crate::registry::roots::Root>) -> Result<(), McpError> {
        self.session.roots.set(roots).await;
        self.session.notify_roots_list_changed().await
    }

    /// Adds one root and broadcasts `notifications/roots/list_changed` if
    /// advertised.
    pub async fn add_root(&self, root: crate::registry::roots::Root) -> Result<(), McpError> {
        self.session.roots.add(root).await;
        self.session.notify_roots_list_changed().await
    }

    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult, McpError> {
        self.require_tools().await?;
        let params = cursor.map(|c| json!({"cursor": c}));
        let value = self.session.call(methods::TOOLS_LIST, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult, McpError> {
        self.require_tools().await?;
        let params = json!({"name": name, "arguments": arguments.unwrap_or(Value::Null)});
        let value = self.session.call(methods::TOOLS_CALL, Some(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`Client::call_tool`], but attaches a progress token and returns a
    /// channel of `notifications/progress` the server may emit while the call
    /// is in flight alongside a handle resolving to the terminal result
    /// (spec.md §4.7).
    pub async fn call_tool_with_progress(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<
        (
            tokio::sync::mpsc::UnboundedReceiver<crate::progress::ProgressNotification>,
            tokio::task::JoinHandle<Result<CallToolResult, McpError>>,
        ),
        McpError,
    > {
        self.require_tools().await?;
        let params = json!({"name": name, "arguments": arguments.unwrap_or(Value::Null)});
        let (progress_rx, value_handle) = self.session.call_with_progress(methods::TOOLS_CALL, Some(params)).await?;
        let handle = tokio::spawn(async move {
            let value = value_handle.await.map_err(|_| McpError::Disconnected)??;
            Ok(serde_json::from_value(value)?)
        });
        Ok((progress_rx, handle))
    }

    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<ListPromptsResult, McpError> {
        let params = cursor.map(|c| json!({"cursor": c}));
        let value = self.session.call(methods::PROMPTS_LIST, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult, McpError> {
        let params = json!({"name": name, "arguments": arguments.unwrap_or(Value::Null)});
        let value = self.session.call(methods::PROMPTS_GET, Some(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_resources(&self, cursor: Option<&str>) -> Result<ListResourcesResult, McpError> {
        let params = cursor.map(|c| json!({"cursor": c}));
        let value = self.session.call(methods::RESOURCES_LIST, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_resource_templates(&self, cursor: Option<&str>) -> Result<ListResourceTemplatesResult, McpError> {
        let params = cursor.map(|c| json!({"cursor": c}));
        let value = self.session.call(methods::RESOURCES_TEMPLATES_LIST, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let value = self.session.call(methods::RESOURCES_READ, Some(json!({"uri": uri}))).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        let subscribe_advertised = self
            .session
            .peer_server_capabilities()
            .await
            .map(|c| c.supports_resource_subscribe())
            .unwrap_or(false);
        self.session
            .require_capability(methods::RESOURCES_SUBSCRIBE, "resources.subscribe", subscribe_advertised)
            .await?;
        self.session.call(methods::RESOURCES_SUBSCRIBE, Some(json!({"uri": uri}))).await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        self.session.call(methods::RESOURCES_UNSUBSCRIBE, Some(json!({"uri": uri}))).await?;
        Ok(())
    }

    pub async fn complete(&self, r#ref: Value, argument: Value) -> Result<CompleteResult, McpError> {
        let completions_advertised = self
            .session
            .peer_server_capabilities()
            .await
            .map(|c| c.supports_completions())
            .unwrap_or(false);
        self.session
            .require_capability(methods::COMPLETION_COMPLETE, "completions", completions_advertised)
            .await?;
        let value = self
            .session
            .call(methods::COMPLETION_COMPLETE, Some(json!({"ref": r#ref, "argument": argument})))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_log_level(&self, level: crate::logging::LogLevel) -> Result<(), McpError> {
        let logging_advertised = self
            .session
            .peer_server_capabilities()
            .await
            .map(|c| c.supports_logging())
            .unwrap_or(false);
        self.session
            .require_capability(methods::LOGGING_SET_LEVEL, "logging", logging_advertised)
            .await?;
        self.session
            .call(methods::LOGGING_SET_LEVEL, Some(serde_json::to_value(crate::logging::SetLevelParams { level })?))
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, id: RequestId, reason: &str) -> Result<(), McpError> {
        self.session.cancel(id, reason).await
    }

    pub async fn state(&self) -> SessionState {
        self.session.state().await
    }

    /// Ends the connection: aborts the read loop and releases the transport.
    pub async fn close(self) -> Result<(), McpError> {
        self.run_handle.abort();
        Ok(())
    }

    async fn require_tools(&self) -> Result<(), McpError> {
        let present = self
            .session
            .peer_server_capabilities()
            .await
            .map(|c| c.supports_tools())
            .unwrap_or(false);
        self.session.require_capability("tools/*", "tools", present).await
    }
}

/// Serves `roots/list` out of the session's own `RootRegistry`: the server
/// asks, the client answers from whatever roots the embedding application
/// registered locally. No user callback needed.
async fn register_roots_handler(session: &Arc<Session>) -> Result<(), McpError> {
    session
        .dispatcher
        .register_request(
            methods::ROOTS_LIST,
            Arc::new(move |ctx, _params| -> BoxFuture<'static, Result<Value, McpError>> {
                Box::pin(async move {
                    let roots = ctx.session.roots.list().await;
                    Ok(json!({"roots": roots}))
                })
            }),
        )
        .await
}

async fn register_peer_request_handler(
    session: &Arc<Session>,
    method: &'static str,
    handler: PeerRequestHandler,
) -> Result<(), McpError> {
    session
        .dispatcher
        .register_request(
            method,
            Arc::new(move |_ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                let handler = handler.clone();
                Box::pin(async move {
                    handler(params.unwrap_or(Value::Null))
                        .await
                        .map_err(McpError::Internal)
                })
            }),
        )
        .await
}
