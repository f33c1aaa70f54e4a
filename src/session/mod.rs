//! The per-connection session state machine (spec.md §3, §4.5).

pub mod capabilities;
pub mod handshake;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::correlator::{Correlator, Outcome};
use crate::dispatcher::Dispatcher;
use crate::error::McpError;
use crate::logging::LogFilter;
use crate::methods;
use crate::progress::ProgressTracker;
use crate::registry::{PromptRegistry, ResourceRegistry, RootRegistry, ToolRegistry};
use crate::transport::Transport;
use crate::wire::{Message, RequestId};

use capabilities::{ClientCapabilities, ServerCapabilities};
use handshake::{negotiate, require_supported, Implementation, InitializeParams, InitializeResult};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Mirrors spec.md §4.5's state table exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    AwaitingInitResponse,
    AwaitingInitialized,
    AwaitingInitializedNotify,
    Operational,
    Closed,
    Failed,
}

/// Local/peer capability sets, shaped differently depending on which side of
/// the handshake this session is negotiating.
enum LocalCapabilities {
    Client(ClientCapabilities),
    Server(ServerCapabilities),
}

enum PeerCapabilities {
    Unknown,
    Client(ClientCapabilities),
    Server(ServerCapabilities),
}

/// One connection to a peer. Owns the dispatch tables, feature registries,
/// correlator, and negotiated state spec.md §3 lists as a Session's fields.
pub struct Session {
    role: Role,
    transport: Arc<dyn Transport>,
    state: RwLock<SessionState>,
    local_capabilities: LocalCapabilities,
    peer_capabilities: RwLock<PeerCapabilities>,
    implementation: Implementation,
    peer_implementation: RwLock<Option<Implementation>>,
    instructions: Option<String>,
    peer_instructions: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_id: AtomicI64,
    initialize_id: RwLock<Option<RequestId>>,
    default_timeout: Duration,

    pub correlator: Correlator,
    pub dispatcher: Arc<Dispatcher>,
    pub tools: ToolRegistry,
    pub prompts: PromptRegistry,
    pub resources: ResourceRegistry,
    pub roots: RootRegistry,
    pub progress: tokio::sync::Mutex<ProgressTracker>,
    pub log_filter: tokio::sync::Mutex<LogFilter>,
}

impl Session {
    pub fn new_client(transport: Arc<dyn Transport>, implementation: Implementation, capabilities: ClientCapabilities) -> Arc<Self> {
        Arc::new(Self {
            role: Role::Client,
            transport,
            state: RwLock::new(SessionState::Created),
            local_capabilities: LocalCapabilities::Client(capabilities),
            peer_capabilities: RwLock::new(PeerCapabilities::Unknown),
            implementation,
            peer_implementation: RwLock::new(None),
            instructions: None,
            peer_instructions: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicI64::new(1),
            initialize_id: RwLock::new(None),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            correlator: Correlator::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            tools: ToolRegistry::new(),
            prompts: PromptRegistry::new(),
            resources: ResourceRegistry::new(),
            roots: RootRegistry::new(),
            progress: tokio::sync::Mutex::new(ProgressTracker::new()),
            log_filter: tokio::sync::Mutex::new(LogFilter::new()),
        })
    }

    pub fn new_server(
        transport: Arc<dyn Transport>,
        implementation: Implementation,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role: Role::Server,
            transport,
            state: RwLock::new(SessionState::Created),
            local_capabilities: LocalCapabilities::Server(capabilities),
            peer_capabilities: RwLock::new(PeerCapabilities::Unknown),
            implementation,
            peer_implementation: RwLock::new(None),
            instructions,
            peer_instructions: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicI64::new(1),
            initialize_id: RwLock::new(None),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            correlator: Correlator::new(),
            dispatcher: Arc::new(Dispatcher::new()),
            tools: ToolRegistry::new(),
            prompts: PromptRegistry::new(),
            resources: ResourceRegistry::new(),
            roots: RootRegistry::new(),
            progress: tokio::sync::Mutex::new(ProgressTracker::new()),
            log_filter: tokio::sync::Mutex::new(LogFilter::new()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        debug!(?state, "session state transition");
        *self.state.write().await = state;
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().await.clone()
    }

    pub async fn peer_implementation(&self) -> Option<Implementation> {
        self.peer_implementation.read().await.clone()
    }

    pub async fn peer_server_capabilities(&self) -> Option<ServerCapabilities> {
        match &*self.peer_capabilities.read().await {
            PeerCapabilities::Server(caps) => Some(caps.clone()),
            _ => None,
        }
    }

    pub async fn peer_client_capabilities(&self) -> Option<ClientCapabilities> {
        match &*self.peer_capabilities.read().await {
            PeerCapabilities::Client(caps) => Some(caps.clone()),
            _ => None,
        }
    }

    /// This session's own advertised capabilities, if it is server-role.
    /// Used by the server facade to decide which built-in handlers to
    /// register; a client-role session has none to offer.
    pub fn local_server_capabilities(&self) -> Option<ServerCapabilities> {
        match &self.local_capabilities {
            LocalCapabilities::Server(caps) => Some(caps.clone()),
            LocalCapabilities::Client(_) => None,
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Local programming-error guard (spec.md §3): call before invoking a
    /// peer method that requires a capability they did not advertise.
    pub async fn require_capability(&self, method: &str, capability: &str, present: bool) -> Result<(), McpError> {
        if present {
            Ok(())
        } else {
            Err(McpError::Capability {
                method: method.to_string(),
                capability: capability.to_string(),
            })
        }
    }

    /// Sends a request and awaits its reply, honoring the session's default
    /// timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.call_with_timeout(method, params, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, McpError> {
        let id = self.next_request_id();
        let rx = self.correlator.register(id.clone(), timeout).await?;
        self.transport.send(Message::request(id.clone(), method, params)).await?;
        match rx.await.map_err(|_| McpError::Disconnected)?? {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(McpError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            Outcome::Cancelled { reason } => Err(McpError::Cancelled(id, reason)),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.transport.send(Message::notification(method, params)).await
    }

    /// Sends a request with `_meta.progressToken` attached, returning both a
    /// channel of `notifications/progress` the peer may emit while the
    /// request is in flight and a handle that resolves to the terminal reply
    /// (spec.md §3, §4.7). The token is retired once the reply arrives.
    pub async fn call_with_progress(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
    ) -> Result<
        (
            tokio::sync::mpsc::UnboundedReceiver<crate::progress::ProgressNotification>,
            tokio::task::JoinHandle<Result<Value, McpError>>,
        ),
        McpError,
    > {
        let id = self.next_request_id();
        let token = crate::progress::ProgressToken::from(id.clone());
        let progress_rx = self.progress.lock().await.subscribe(token.clone());

        let rx = self.correlator.register(id.clone(), self.default_timeout).await?;
        let mut message = Message::request(id.clone(), method, params);
        if let Message::Request { meta, .. } = &mut message {
            *meta = Some(serde_json::json!({"progressToken": token}));
        }
        self.transport.send(message).await?;

        let session = self.clone();
        let handle = tokio::spawn(async move {
            // Retire the token on every exit from this task — success,
            // timeout, disconnect, and cancellation are all terminal
            // (spec.md §4.7) — before translating the outcome, not only on
            // the happy path.
            let outcome = rx.await.map_err(|_| McpError::Disconnected).and_then(|r| r);
            session.progress.lock().await.retire(&token);
            match outcome? {
                Outcome::Result(value) => Ok(value),
                Outcome::Error(error) => Err(McpError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                Outcome::Cancelled { reason } => Err(McpError::Cancelled(id, reason)),
            }
        });

        Ok((progress_rx, handle))
    }

    /// Local cancellation: tells the peer to stop and wakes our own waiter.
    /// `initialize` is not cancellable (spec.md §4.3, §4.7).
    pub async fn cancel(&self, id: RequestId, reason: &str) -> Result<(), McpError> {
        if self.initialize_id.read().await.as_ref() == Some(&id) {
            return Err(McpError::InvalidRequest("the initialize request cannot be cancelled".into()));
        }
        self.correlator.cancel_local(&id, reason).await;
        self.notify(
            methods::NOTIFY_CANCELLED,
            Some(serde_json::json!({"requestId": request_id_to_json(&id), "reason": reason})),
        )
        .await
    }

    pub async fn notify_resource_updated(&self, uri: &str) -> Result<(), McpError> {
        if self.resources.is_subscribed(uri).await {
            self.notify(methods::NOTIFY_RESOURCES_UPDATED, Some(serde_json::json!({"uri": uri})))
                .await?;
        }
        Ok(())
    }

    pub async fn notify_tools_list_changed(&self) -> Result<(), McpError> {
        if self.server_capabilities_advertise_list_changed(|c| c.tools.as_ref().and_then(|t| t.list_changed)) {
            self.notify(methods::NOTIFY_TOOLS_LIST_CHANGED, None).await?;
        }
        Ok(())
    }

    pub async fn notify_prompts_list_changed(&self) -> Result<(), McpError> {
        if self.server_capabilities_advertise_list_changed(|c| c.prompts.as_ref().and_then(|p| p.list_changed)) {
            self.notify(methods::NOTIFY_PROMPTS_LIST_CHANGED, None).await?;
        }
        Ok(())
    }

    pub async fn notify_resources_list_changed(&self) -> Result<(), McpError> {
        if self.server_capabilities_advertise_list_changed(|c| c.resources.as_ref().and_then(|r| r.list_changed)) {
            self.notify(methods::NOTIFY_RESOURCES_LIST_CHANGED, None).await?;
        }
        Ok(())
    }

    pub async fn notify_roots_list_changed(&self) -> Result<(), McpError> {
        if let LocalCapabilities::Client(caps) = &self.local_capabilities {
            if caps.roots.as_ref().and_then(|r| r.list_changed).unwrap_or(false) {
                self.notify(methods::NOTIFY_ROOTS_LIST_CHANGED, None).await?;
            }
        }
        Ok(())
    }

    fn server_capabilities_advertise_list_changed(&self, pick: impl Fn(&ServerCapabilities) -> Option<bool>) -> bool {
        matches!(&self.local_capabilities, LocalCapabilities::Server(caps) if pick(caps).unwrap_or(false))
    }

    /// Drives the client-side handshake: `Connecting` → `initialize` call →
    /// `notifications/initialized` → `Operational` (spec.md §4.5).
    pub async fn client_handshake(self: &Arc<Self>) -> Result<InitializeResult, McpError> {
        let LocalCapabilities::Client(capabilities) = &self.local_capabilities else {
            return Err(McpError::Internal("client_handshake called on a server session".into()));
        };

        self.set_state(SessionState::Connecting).await;
        let id = self.next_request_id();
        *self.initialize_id.write().await = Some(id.clone());
        self.set_state(SessionState::AwaitingInitResponse).await;

        let params = InitializeParams {
            protocol_version: handshake::LATEST_VERSION.to_string(),
            capabilities: capabilities.clone(),
            client_info: self.implementation.clone(),
            extra: Default::default(),
        };

        let rx = self.correlator.register(id.clone(), self.default_timeout).await?;
        self.transport
            .send(Message::request(id.clone(), methods::INITIALIZE, Some(serde_json::to_value(&params)?)))
            .await?;
        let outcome = rx.await.map_err(|_| McpError::Disconnected)??;
        let value = match outcome {
            Outcome::Result(value) => value,
            Outcome::Error(error) => {
                self.set_state(SessionState::Failed).await;
                return Err(McpError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                });
            }
            // `cancel` refuses to cancel the initialize request (above), so
            // this is unreachable in practice; handled for exhaustiveness.
            Outcome::Cancelled { reason } => {
                self.set_state(SessionState::Failed).await;
                return Err(McpError::Cancelled(id, reason));
            }
        };

        let result: InitializeResult = serde_json::from_value(value)?;
        if require_supported(&result.protocol_version).is_err() {
            self.set_state(SessionState::Failed).await;
            return Err(McpError::VersionUnsupported(result.protocol_version));
        }

        *self.protocol_version.write().await = Some(result.protocol_version.clone());
        *self.peer_implementation.write().await = Some(result.server_info.clone());
        *self.peer_capabilities.write().await = PeerCapabilities::Server(result.capabilities.clone());
        *self.peer_instructions.write().await = result.instructions.clone();

        self.set_state(SessionState::AwaitingInitializedNotify).await;
        self.notify(methods::INITIALIZED, None).await?;
        self.set_state(SessionState::Operational).await;

        Ok(result)
    }

    /// Runs the session's read loop until the transport closes or fails.
    /// Intended to be spawned as its own task by the embedding client/server
    /// facade.
    pub async fn run(self: Arc<Self>) -> Result<(), McpError> {
        if matches!(self.state().await, SessionState::Created) {
            self.set_state(SessionState::Connecting).await;
        }
        loop {
            match self.transport.recv().await {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle_inbound(message).await {
                        warn!(error = %e, "error handling inbound message");
                    }
                }
                Ok(None) => {
                    self.set_state(SessionState::Closed).await;
                    self.correlator.fail_all().await;
                    return Ok(());
                }
                Err(e) => {
                    self.set_state(SessionState::Failed).await;
                    self.correlator.fail_all().await;
                    return Err(e);
                }
            }
        }
    }

    /// Dispatches one inbound frame. Requests are handed to their own
    /// spawned task so a slow handler never blocks the read loop from
    /// picking up the next frame — multiple handlers run concurrently and
    /// reply in completion order, not arrival order (spec.md §5).
    async fn handle_inbound(self: &Arc<Self>, message: Message) -> Result<(), McpError> {
        match message {
            Message::Request { id, method, params, meta, .. } => {
                let session = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.handle_inbound_request(id, method, params, meta).await {
                        warn!(error = %e, "error handling inbound request");
                    }
                });
                Ok(())
            }
            Message::Notification { method, params, .. } => {
                self.handle_inbound_notification(method, params).await;
                Ok(())
            }
            Message::Response { id, result, .. } => {
                self.correlator.complete(&id, Outcome::Result(result)).await;
                Ok(())
            }
            Message::Error { id, error, .. } => {
                let pending = match &id {
                    Some(id) => self.correlator.is_pending(id).await,
                    None => false,
                };
                if pending {
                    self.correlator.complete(id.as_ref().unwrap(), Outcome::Error(error)).await;
                } else {
                    self.dispatcher.dispatch_error(self.clone(), id, error).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_inbound_request(
        self: &Arc<Self>,
        id: RequestId,
        method: String,
        params: Option<Value>,
        meta: Option<Value>,
    ) -> Result<(), McpError> {
        if method == methods::PING {
            return self.transport.send(Message::response(id, serde_json::json!({}))).await;
        }

        if method == methods::INITIALIZE && self.role == Role::Server {
            return self.handle_server_initialize(id, params).await;
        }

        if !self.is_operational_or_allowed(&method).await {
            return self
                .transport
                .send(Message::error(
                    Some(id),
                    crate::error::JsonRpcErrorCode::INVALID_REQUEST.0,
                    format!("method `{method}` is not permitted before the session is operational"),
                    None,
                ))
                .await;
        }

        let progress_token = crate::progress::token_from_meta(&meta);
        match self
            .dispatcher
            .dispatch_request(self.clone(), id.clone(), &method, params, progress_token)
            .await
        {
            Ok(result) => self.transport.send(Message::response(id, result)).await,
            Err(error) => {
                let code = error.wire_code();
                let message = error.to_string();
                let data = (code == crate::error::JsonRpcErrorCode::INTERNAL_ERROR)
                    .then(|| serde_json::json!({"details": message}));
                self.transport.send(Message::error(Some(id), code.0, message, data)).await
            }
        }
    }

    async fn handle_server_initialize(self: &Arc<Self>, id: RequestId, params: Option<Value>) -> Result<(), McpError> {
        let params: InitializeParams = match params.ok_or_else(|| McpError::InvalidParams("missing initialize params".into())) {
            Ok(v) => serde_json::from_value(v)?,
            Err(e) => {
                return self
                    .transport
                    .send(Message::error(Some(id), e.wire_code().0, e.to_string(), None))
                    .await
            }
        };

        self.set_state(SessionState::AwaitingInitialized).await;
        *self.peer_implementation.write().await = Some(params.client_info.clone());
        *self.peer_capabilities.write().await = PeerCapabilities::Client(params.capabilities.clone());

        let negotiated = negotiate(&params.protocol_version);
        *self.protocol_version.write().await = Some(negotiated.to_string());

        let LocalCapabilities::Server(capabilities) = &self.local_capabilities else {
            return Err(McpError::Internal("server initialize handler on a client session".into()));
        };

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: capabilities.clone(),
            server_info: self.implementation.clone(),
            instructions: self.instructions.clone(),
            extra: Default::default(),
        };

        self.transport.send(Message::response(id, serde_json::to_value(&result)?)).await
    }

    async fn handle_inbound_notification(self: &Arc<Self>, method: String, params: Option<Value>) {
        if method == methods::INITIALIZED && self.role == Role::Server {
            if self.state().await == SessionState::AwaitingInitialized {
                self.set_state(SessionState::Operational).await;
            }
            return;
        }

        if method == methods::NOTIFY_CANCELLED {
            if let Some(params) = &params {
                if let Some(id) = params.get("requestId").and_then(parse_json_request_id) {
                    self.dispatcher.mark_cancelled(&id).await;
                }
            }
            return;
        }

        if method == methods::NOTIFY_PROGRESS {
            if let Some(params) = params {
                match serde_json::from_value(params) {
                    Ok(notification) => self.progress.lock().await.dispatch(notification),
                    Err(e) => debug!(error = %e, "malformed notifications/progress payload"),
                }
            }
            return;
        }

        if !self.is_operational_or_allowed(&method).await {
            debug!(method, "dropping notification before session is operational");
            return;
        }

        self.dispatcher.dispatch_notification(self.clone(), &method, params).await;
    }

    async fn is_operational_or_allowed(&self, method: &str) -> bool {
        if self.state().await == SessionState::Operational {
            return true;
        }
        matches!(method, methods::INITIALIZE | methods::INITIALIZED | methods::PING)
    }
}

fn request_id_to_json(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::Number((*n).into()),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

fn parse_json_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) => Some(RequestId::String(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn full_handshake_reaches_operational() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = Session::new_client(Arc::new(client_transport), client_impl(), ClientCapabilities::default());
        let server = Session::new_server(
            Arc::new(server_transport),
            server_impl(),
            ServerCapabilities {
                tools: Some(capabilities::ToolsCapability::default()),
                ..Default::default()
            },
            Some("welcome".into()),
        );

        let server_run = tokio::spawn(server.clone().run());
        let result = client.client_handshake().await.unwrap();

        assert_eq!(result.protocol_version, handshake::LATEST_VERSION);
        assert_eq!(client.state().await, SessionState::Operational);

        // Give the server task a tick to observe `notifications/initialized`.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.state().await, SessionState::Operational);

        drop(client);
        let _ = tokio::time::timeout(Duration::from_millis(50), server_run).await;
    }

    #[tokio::test]
    async fn request_before_operational_is_rejected() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = Session::new_server(
            Arc::new(server_transport),
            server_impl(),
            ServerCapabilities::default(),
            None,
        );
        let server_run = tokio::spawn(server.run());

        client_transport
            .send(Message::request(RequestId::Number(99), methods::TOOLS_LIST, None))
            .await
            .unwrap();
        let reply = client_transport.recv().await.unwrap().unwrap();
        match reply {
            Message::Error { error, .. } => {
                assert_eq!(error.code, crate::error::JsonRpcErrorCode::INVALID_REQUEST.0)
            }
            other => panic!("unexpected {other:?}"),
        }
        server_run.abort();
    }

    #[tokio::test]
    async fn progress_round_trip() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = Session::new_client(Arc::new(client_transport), client_impl(), ClientCapabilities::default());
        let server = Session::new_server(Arc::new(server_transport), server_impl(), ServerCapabilities::default(), None);

        server
            .dispatcher
            .register_request(
                "demo/work",
                Arc::new(|ctx, _params| {
                    Box::pin(async move {
                        ctx.report_progress(0.3, Some(1.0), None).await?;
                        Ok(serde_json::json!({"done": true}))
                    })
                }),
            )
            .await
            .unwrap();

        let server_run = tokio::spawn(server.clone().run());
        client.client_handshake().await.unwrap();

        let (mut progress_rx, handle) = client.call_with_progress("demo/work", None).await.unwrap();
        let notification = progress_rx.recv().await.unwrap();
        assert_eq!(notification.progress, 0.3);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"done": true}));

        server_run.abort();
    }
}
