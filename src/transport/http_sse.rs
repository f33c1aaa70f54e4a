//! HTTP+SSE transport (spec.md §4.2): the client POSTs each outbound message
//! and receives replies as Server-Sent Events on a long-lived GET, both
//! carrying a shared `Mcp-Session-Id` header. Grounded in `clawde-io-apps`'s
//! axum daemon (server side) and `bobmatnyc-rustbot`/`clawde-io-apps`'s
//! reqwest usage (client side).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::transport::Transport;
use crate::wire::Message;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const BROADCAST_CAPACITY: usize = 256;

// ---------------------------------------------------------------- server --

struct SessionChannels {
    inbound: mpsc::UnboundedSender<Message>,
    outbound: broadcast::Sender<Message>,
}

#[derive(Clone)]
struct AppState {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionChannels>>>>,
    new_sessions: mpsc::UnboundedSender<HttpSseServerTransport>,
}

/// One connected client's half of the server-side transport. Produced by
/// [`HttpSseServer::serve`] as clients connect; the embedding server facade
/// hands each one to a fresh `Session`.
pub struct HttpSseServerTransport {
    session_id: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    outbound: broadcast::Sender<Message>,
}

impl HttpSseServerTransport {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for HttpSseServerTransport {
    async fn send(&self, message: Message) -> Result<(), McpError> {
        // A send with no subscribed SSE stream yet is a transient condition,
        // not a disconnect — the reconnect contract in spec.md §4.2 allows a
        // client to resume the same session id later.
        if self.outbound.send(message).is_err() {
            warn!(session_id = %self.session_id, "dropped outbound frame: no active SSE stream");
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Message>, McpError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

/// Listens for MCP clients over HTTP+SSE. Each distinct `Mcp-Session-Id`
/// becomes one [`HttpSseServerTransport`] delivered through the returned
/// channel, mirroring how a `TcpListener::accept()` loop hands off
/// connections.
pub struct HttpSseServer;

impl HttpSseServer {
    pub async fn serve(
        addr: SocketAddr,
        path: impl Into<String>,
    ) -> Result<(mpsc::UnboundedReceiver<HttpSseServerTransport>, JoinHandle<Result<(), McpError>>), McpError> {
        let path = path.into();
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let state = AppState {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            new_sessions: new_tx,
        };

        let app = Router::new()
            .route(&path, get(handle_sse).post(handle_post))
            .layer(tower_http::cors::CorsLayer::permissive())
            .with_state(state);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|e| McpError::Transport(e.to_string()))
        });

        Ok((new_rx, handle))
    }
}

async fn get_or_create_session(state: &AppState, session_id: &str) -> Arc<SessionChannels> {
    if let Some(existing) = state.sessions.read().await.get(session_id) {
        return existing.clone();
    }
    let mut sessions = state.sessions.write().await;
    if let Some(existing) = sessions.get(session_id) {
        return existing.clone();
    }

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
    let channels = Arc::new(SessionChannels {
        inbound: inbound_tx,
        outbound: outbound_tx.clone(),
    });
    sessions.insert(session_id.to_string(), channels.clone());

    let transport = HttpSseServerTransport {
        session_id: session_id.to_string(),
        inbound: Mutex::new(inbound_rx),
        outbound: outbound_tx,
    };
    if state.new_sessions.send(transport).is_err() {
        debug!("no listener for new HTTP+SSE sessions");
    }

    channels
}

async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let session_id = session_id_from_headers(&headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let message = Message::decode(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let channels = get_or_create_session(&state, &session_id).await;
    channels
        .inbound
        .send(message)
        .map_err(|_| StatusCode::GONE)?;

    let mut response = StatusCode::ACCEPTED.into_response();
    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

async fn handle_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let session_id = session_id_from_headers(&headers).ok_or(StatusCode::BAD_REQUEST)?;
    let channels = get_or_create_session(&state, &session_id).await;
    let receiver = channels.outbound.subscribe();

    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(message) => {
                let json = String::from_utf8_lossy(&message.encode()).into_owned();
                Some(Ok(Event::default().data(json)))
            }
            Err(_) => None,
        }
    });

    Ok(Sse::new(stream))
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ---------------------------------------------------------------- client --

pub struct HttpSseClientTransport {
    http: reqwest::Client,
    base_url: String,
    path: String,
    bearer_token: Option<String>,
    session_id: Mutex<Option<String>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Message, McpError>>>,
    sse_task: JoinHandle<()>,
}

impl HttpSseClientTransport {
    /// Connects to `base_url` + `path`, attaching `Authorization: Bearer
    /// <bearer_token>` to every request if given. The token is passed
    /// through unexamined; validating it is the peer's job.
    pub async fn connect(
        base_url: impl Into<String>,
        path: impl Into<String>,
        bearer_token: Option<String>,
    ) -> Result<Self, McpError> {
        let base_url = base_url.into();
        let path = path.into();
        let session_id = uuid::Uuid::new_v4().to_string();
        let http = reqwest::Client::new();

        let mut request = http
            .get(format!("{base_url}{path}"))
            .header("Accept", "text/event-stream")
            .header(SESSION_HEADER, &session_id);
        if let Some(token) = &bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sse_task = tokio::spawn(read_sse_loop(response, tx));

        Ok(Self {
            http,
            base_url,
            path,
            bearer_token,
            session_id: Mutex::new(Some(session_id)),
            inbound: Mutex::new(rx),
            sse_task,
        })
    }
}

#[async_trait]
impl Transport for HttpSseClientTransport {
    async fn send(&self, message: Message) -> Result<(), McpError> {
        let session_id = self.session_id.lock().await.clone();
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, self.path))
            .header("content-type", "application/json")
            .body(message.encode());
        if let Some(id) = &session_id {
            request = request.header(SESSION_HEADER, id);
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| McpError::Transport(e.to_string()))?;
        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            *self.session_id.lock().await = Some(id.to_string());
        }
        response
            .error_for_status()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Message>, McpError> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.sse_task.abort();
        Ok(())
    }
}

async fn read_sse_loop(response: reqwest::Response, tx: mpsc::UnboundedSender<Result<Message, McpError>>) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(boundary) = buffer.find("\n\n") {
                    let event = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);
                    for line in event.lines() {
                        if let Some(data) = line.strip_prefix("data:") {
                            if tx.send(Message::decode(data.trim().as_bytes())).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(McpError::Transport(e.to_string())));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_extracted_case_sensitively_from_header_name() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "abc123".parse().unwrap());
        assert_eq!(session_id_from_headers(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn missing_session_header_is_none() {
        assert_eq!(session_id_from_headers(&HeaderMap::new()), None);
    }
}
