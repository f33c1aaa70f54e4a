//! High-level server facade: wires a `Session` to a `Transport`, registers
//! the built-in registry-backed handlers the session's advertised
//! capabilities promise, and exposes registration methods for the
//! embedding application's tools, prompts, resources, and completions.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::dispatcher::BoxFuture;
use crate::error::McpError;
use crate::logging::{LogLevel, SetLevelParams};
use crate::methods;
use crate::registry::prompts::Prompt;
use crate::registry::resources::{Resource, ResourceTemplate};
use crate::registry::tools::Tool;
use crate::session::capabilities::ServerCapabilities;
use crate::session::handshake::Implementation;
use crate::session::Session;
use crate::transport::Transport;

/// Answers `completion/complete` for one `ref`/`argument` pair. Capped at 100
/// values on the way out per spec.md §6; a handler returning more is
/// truncated, not rejected.
pub type CompletionHandler =
    Arc<dyn Fn(Value, Value) -> BoxFuture<'static, Result<Vec<String>, String>> + Send + Sync>;

const MAX_COMPLETION_VALUES: usize = 100;

pub struct Server {
    session: Arc<Session>,
    completion_handler: Arc<Mutex<Option<CompletionHandler>>>,
}

impl Server {
    pub async fn new(
        transport: Arc<dyn Transport>,
        implementation: Implementation,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
    ) -> Result<Self, McpError> {
        let completion_handler = Arc::new(Mutex::new(None));
        let session = Session::new_server(transport, implementation, capabilities, instructions);
        register_builtin_handlers(&session, completion_handler.clone()).await?;
        Ok(Self {
            session,
            completion_handler,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn register_tool(&self, tool: Tool) -> Result<(), McpError> {
        self.session.tools.register(tool).await?;
        self.session.notify_tools_list_changed().await
    }

    pub async fn unregister_tool(&self, name: &str) -> Result<(), McpError> {
        if self.session.tools.unregister(name).await {
            self.session.notify_tools_list_changed().await
        } else {
            Ok(())
        }
    }

    pub async fn register_prompt(&self, prompt: Prompt) -> Result<(), McpError> {
        self.session.prompts.register(prompt).await?;
        self.session.notify_prompts_list_changed().await
    }

    pub async fn unregister_prompt(&self, name: &str) -> Result<(), McpError> {
        if self.session.prompts.unregister(name).await {
            self.session.notify_prompts_list_changed().await
        } else {
            Ok(())
        }
    }

    pub async fn register_resource(&self, resource: Resource) -> Result<(), McpError> {
        self.session.resources.register_fixed(resource).await?;
        self.session.notify_resources_list_changed().await
    }

    pub async fn register_resource_template(&self, template: ResourceTemplate) -> Result<(), McpError> {
        self.session.resources.register_template(template).await?;
        self.session.notify_resources_list_changed().await
    }

    /// Tells subscribed clients a resource's content changed, if anyone
    /// subscribed to it.
    pub async fn notify_resource_updated(&self, uri: &str) -> Result<(), McpError> {
        self.session.notify_resource_updated(uri).await
    }

    /// Emits a protocol-level `notifications/message` log event, dropping it
    /// if it is below the level the client last requested via
    /// `logging/setLevel` (spec.md §4.7).
    pub async fn log(&self, level: LogLevel, logger: Option<String>, data: Value) -> Result<(), McpError> {
        if self.session.log_filter.lock().await.is_suppressed(level) {
            return Ok(());
        }
        self.session
            .notify(
                methods::NOTIFY_MESSAGE,
                Some(json!({"level": level, "logger": logger, "data": data})),
            )
            .await
    }

    /// Issues a server-initiated `sampling/createMessage` request, rejected
    /// locally with `CapabilityError` unless the client advertised `sampling`
    /// (spec.md §3, §6).
    pub async fn create_message(&self, params: Value) -> Result<Value, McpError> {
        let present = self
            .session
            .peer_client_capabilities()
            .await
            .map(|c| c.supports_sampling())
            .unwrap_or(false);
        self.session
            .require_capability(methods::SAMPLING_CREATE_MESSAGE, "sampling", present)
            .await?;
        self.session.call(methods::SAMPLING_CREATE_MESSAGE, Some(params)).await
    }

    /// Issues a server-initiated `elicitation/create` request. Per spec.md's
    /// Open Question resolution, gated the same way `sampling` is: rejected
    /// locally unless the client advertised `elicitation`.
    pub async fn elicit(&self, params: Value) -> Result<Value, McpError> {
        let present = self
            .session
            .peer_client_capabilities()
            .await
            .map(|c| c.supports_elicitation())
            .unwrap_or(false);
        self.session
            .require_capability(methods::ELICITATION_CREATE, "elicitation", present)
            .await?;
        self.session.call(methods::ELICITATION_CREATE, Some(params)).await
    }

    /// Asks the client for its current roots (spec.md §4.6). Rejected
    /// locally unless the client advertised the `roots` capability.
    pub async fn list_roots(&self) -> Result<Value, McpError> {
        let present = self
            .session
            .peer_client_capabilities()
            .await
            .map(|c| c.supports_roots())
            .unwrap_or(false);
        self.session.require_capability(methods::ROOTS_LIST, "roots", present).await?;
        self.session.call(methods::ROOTS_LIST, None).await
    }

    /// Installs the callback that answers `completion/complete`. Replaces
    /// any previously set handler.
    pub async fn set_completion_handler(&self, handler: CompletionHandler) {
        *self.completion_handler.lock().await = Some(handler);
    }

    /// Runs the session's read loop until the transport closes or fails.
    pub async fn run(self) -> Result<(), McpError> {
        self.session.run().await
    }
}

async fn register_builtin_handlers(
    session: &Arc<Session>,
    completion_handler: Arc<Mutex<Option<CompletionHandler>>>,
) -> Result<(), McpError> {
    let capabilities = match session_local_server_capabilities(session) {
        Some(c) => c,
        None => return Ok(()),
    };

    let dispatcher = &session.dispatcher;

    if capabilities.supports_tools() {
        dispatcher
            .register_request(
                methods::TOOLS_LIST,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let cursor = extract_cursor(&params);
                        let (tools, next_cursor) = ctx.session.tools.list(cursor.as_deref()).await?;
                        Ok(json!({"tools": tools, "nextCursor": next_cursor}))
                    })
                }),
            )
            .await?;

        dispatcher
            .register_request(
                methods::TOOLS_CALL,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let params = params.ok_or_else(|| McpError::InvalidParams("missing tools/call params".into()))?;
                        let name = params
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| McpError::InvalidParams("tools/call requires `name`".into()))?;
                        let arguments = params.get("arguments").cloned();
                        let result = ctx.session.tools.call(name, arguments).await?;
                        Ok(serde_json::to_value(result)?)
                    })
                }),
            )
            .await?;
    }

    if capabilities.supports_prompts() {
        dispatcher
            .register_request(
                methods::PROMPTS_LIST,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let cursor = extract_cursor(&params);
                        let (prompts, next_cursor) = ctx.session.prompts.list(cursor.as_deref()).await?;
                        Ok(json!({"prompts": prompts, "nextCursor": next_cursor}))
                    })
                }),
            )
            .await?;

        dispatcher
            .register_request(
                methods::PROMPTS_GET,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let params = params.ok_or_else(|| McpError::InvalidParams("missing prompts/get params".into()))?;
                        let name = params
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| McpError::InvalidParams("prompts/get requires `name`".into()))?;
                        let arguments = params.get("arguments").cloned();
                        let messages = ctx.session.prompts.get(name, arguments).await?;
                        Ok(json!({"messages": messages}))
                    })
                }),
            )
            .await?;
    }

    if capabilities.supports_resources() {
        dispatcher
            .register_request(
                methods::RESOURCES_LIST,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let cursor = extract_cursor(&params);
                        let (resources, next_cursor) = ctx.session.resources.list(cursor.as_deref()).await?;
                        Ok(json!({"resources": resources, "nextCursor": next_cursor}))
                    })
                }),
            )
            .await?;

        dispatcher
            .register_request(
                methods::RESOURCES_TEMPLATES_LIST,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let cursor = extract_cursor(&params);
                        let (templates, next_cursor) = ctx.session.resources.list_templates(cursor.as_deref()).await?;
                        Ok(json!({"resourceTemplates": templates, "nextCursor": next_cursor}))
                    })
                }),
            )
            .await?;

        dispatcher
            .register_request(
                methods::RESOURCES_READ,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let uri = params
                            .as_ref()
                            .and_then(|p| p.get("uri"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| McpError::InvalidParams("resources/read requires `uri`".into()))?;
                        let contents = ctx.session.resources.read(uri).await?;
                        Ok(json!({"contents": [contents]}))
                    })
                }),
            )
            .await?;

        if capabilities.supports_resource_subscribe() {
            dispatcher
                .register_request(
                    methods::RESOURCES_SUBSCRIBE,
                    Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                        Box::pin(async move {
                            let uri = params
                                .as_ref()
                                .and_then(|p| p.get("uri"))
                                .and_then(Value::as_str)
                                .ok_or_else(|| McpError::InvalidParams("resources/subscribe requires `uri`".into()))?;
                            ctx.session.resources.subscribe(uri).await?;
                            Ok(json!({}))
                        })
                    }),
                )
                .await?;

            dispatcher
                .register_request(
                    methods::RESOURCES_UNSUBSCRIBE,
                    Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                        Box::pin(async move {
                            let uri = params
                                .as_ref()
                                .and_then(|p| p.get("uri"))
                                .and_then(Value::as_str)
                                .ok_or_else(|| McpError::InvalidParams("resources/unsubscribe requires `uri`".into()))?;
                            ctx.session.resources.unsubscribe(uri).await?;
                            Ok(json!({}))
                        })
                    }),
                )
                .await?;
        }
    }

    if capabilities.supports_logging() {
        dispatcher
            .register_request(
                methods::LOGGING_SET_LEVEL,
                Arc::new(move |ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let params = params.ok_or_else(|| McpError::InvalidParams("missing logging/setLevel params".into()))?;
                        let params: SetLevelParams = serde_json::from_value(params)?;
                        ctx.session.log_filter.lock().await.set_level(params.level);
                        Ok(json!({}))
                    })
                }),
            )
            .await?;
    }

    if capabilities.supports_completions() {
        dispatcher
            .register_request(
                methods::COMPLETION_COMPLETE,
                Arc::new(move |_ctx, params| -> BoxFuture<'static, Result<Value, McpError>> {
                    let completion_handler = completion_handler.clone();
                    Box::pin(async move {
                        let params = params.ok_or_else(|| McpError::InvalidParams("missing completion/complete params".into()))?;
                        let reference = params
                            .get("ref")
                            .cloned()
                            .ok_or_else(|| McpError::InvalidParams("completion/complete requires `ref`".into()))?;
                        let argument = params
                            .get("argument")
                            .cloned()
                            .ok_or_else(|| McpError::InvalidParams("completion/complete requires `argument`".into()))?;

                        let handler = completion_handler.lock().await.clone();
                        let mut values = match handler {
                            Some(handler) => handler(reference, argument)
                                .await
                                .map_err(McpError::Internal)?,
                            None => Vec::new(),
                        };

                        let total = values.len() as u64;
                        let has_more = values.len() > MAX_COMPLETION_VALUES;
                        values.truncate(MAX_COMPLETION_VALUES);

                        Ok(json!({"completion": {"values": values, "total": total, "hasMore": has_more}}))
                    })
                }),
            )
            .await?;
    }

    Ok(())
}

fn extract_cursor(params: &Option<Value>) -> Option<String> {
    params
        .as_ref()
        .and_then(|p| p.get("cursor"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The handlers registered here only ever apply to a server-role session, so
/// this reaches past the session's public API for the `ServerCapabilities` it
/// was constructed with. Exposed as `peer_server_capabilities` would be wrong
/// (that is the *peer's* capabilities); this reads our own.
fn session_local_server_capabilities(session: &Arc<Session>) -> Option<ServerCapabilities> {
    session.local_server_capabilities()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::session::capabilities::{ClientCapabilities, ElicitationCapability, RootsCapability, SamplingCapability};
    use crate::session::handshake::Implementation;
    use crate::transport::in_memory::InMemoryTransport;

    fn client_impl() -> Implementation {
        Implementation {
            name: "test-client".into(),
            version: "0.1.0".into(),
            extra: Default::default(),
        }
    }

    fn server_impl() -> Implementation {
        Implementation {
            name: "test-server".into(),
            version: "0.1.0".into(),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_message_rejected_without_peer_capability() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Server::new(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None)
            .await
            .unwrap();
        let server_run = tokio::spawn(server.session().clone().run());

        let (client, _) = Client::connect(Arc::new(client_transport), client_impl(), ClientCapabilities::default())
            .await
            .unwrap();

        let err = server.create_message(json!({"messages": []})).await.unwrap_err();
        assert!(matches!(err, McpError::Capability { .. }));

        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server_run).await;
    }

    #[tokio::test]
    async fn create_message_round_trips_through_client_handler() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Server::new(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None)
            .await
            .unwrap();
        let server_session = server.session().clone();
        let server_run = tokio::spawn(async move { server_session.run().await });

        let client_caps = ClientCapabilities {
            sampling: Some(SamplingCapability::default()),
            ..Default::default()
        };
        let (client, _) = Client::connect(Arc::new(client_transport), client_impl(), client_caps)
            .await
            .unwrap();
        client
            .set_sampling_handler(Arc::new(|_params| {
                Box::pin(async move { Ok(json!({"role": "assistant", "content": {"type": "text", "text": "hi"}})) })
            }))
            .await
            .unwrap();

        let result = server.create_message(json!({"messages": []})).await.unwrap();
        assert_eq!(result["content"]["text"], "hi");

        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server_run).await;
    }

    #[tokio::test]
    async fn elicit_rejected_without_peer_capability() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Server::new(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None)
            .await
            .unwrap();
        let server_run = tokio::spawn(server.session().clone().run());

        let (client, _) = Client::connect(Arc::new(client_transport), client_impl(), ClientCapabilities::default())
            .await
            .unwrap();

        let err = server.elicit(json!({"message": "confirm?"})).await.unwrap_err();
        assert!(matches!(err, McpError::Capability { .. }));

        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server_run).await;
    }

    #[tokio::test]
    async fn elicit_round_trips_through_client_handler() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Server::new(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None)
            .await
            .unwrap();
        let server_session = server.session().clone();
        let server_run = tokio::spawn(async move { server_session.run().await });

        let client_caps = ClientCapabilities {
            elicitation: Some(ElicitationCapability::default()),
            ..Default::default()
        };
        let (client, _) = Client::connect(Arc::new(client_transport), client_impl(), client_caps)
            .await
            .unwrap();
        client
            .set_elicitation_handler(Arc::new(|_params| {
                Box::pin(async move { Ok(json!({"action": "accept"})) })
            }))
            .await
            .unwrap();

        let result = server.elicit(json!({"message": "confirm?"})).await.unwrap();
        assert_eq!(result["action"], "accept");

        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server_run).await;
    }

    #[tokio::test]
    async fn list_roots_returns_client_registered_roots() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Server::new(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None)
            .await
            .unwrap();
        let server_session = server.session().clone();
        let server_run = tokio::spawn(async move { server_session.run().await });

        let client_caps = ClientCapabilities {
            roots: Some(RootsCapability::default()),
            ..Default::default()
        };
        let (client, _) = Client::connect(Arc::new(client_transport), client_impl(), client_caps)
            .await
            .unwrap();
        client
            .add_root(crate::registry::roots::Root {
                uri: "file:///workspace".into(),
                name: Some("workspace".into()),
            })
            .await
            .unwrap();

        let result = server.list_roots().await.unwrap();
        let roots = result["roots"].as_array().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0]["uri"], "file:///workspace");

        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server_run).await;
    }
}
