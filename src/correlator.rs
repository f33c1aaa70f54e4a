//! Matches inbound responses to outstanding outbound requests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time;

use crate::error::McpError;
use crate::wire::{ErrorObject, RequestId};

/// Terminal outcome of a correlated outbound request.
#[derive(Debug)]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
    /// Local cancellation (spec.md §4.3, §4.7): distinct from `Error` so a
    /// waiter can tell "we gave up on this" apart from "the peer rejected
    /// this", per spec.md §8 scenario 5.
    Cancelled { reason: String },
}

type Waiter = oneshot::Sender<Outcome>;

/// Per-session table of outbound request ids awaiting a reply.
///
/// All mutation is funneled through this struct's `Mutex`; it is the only
/// piece of shared state a `Session` needs for outbound-request bookkeeping
/// (spec.md §4.3, §5).
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<RequestId, Waiter>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new outbound request id, returning a receiver that resolves
    /// on completion, cancellation, or timeout. Fails with `DuplicateId` if
    /// the id is already registered — the caller must pick a fresh id.
    pub async fn register(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Outcome, McpError>>, McpError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = self.pending.lock().await;
            if guard.contains_key(&id) {
                return Err(McpError::DuplicateId(id));
            }
            guard.insert(id.clone(), tx);
        }

        let pending = self.pending.clone();
        let timeout_id = id.clone();
        tokio::spawn(async move {
            match time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => {
                    let _ = outcome_tx.send(Ok(outcome));
                }
                Ok(Err(_)) => {
                    // Sender dropped without completing: treat as disconnect.
                    let _ = outcome_tx.send(Err(McpError::Disconnected));
                }
                Err(_) => {
                    pending.lock().await.remove(&timeout_id);
                    let _ = outcome_tx.send(Err(McpError::Timeout(timeout_id, timeout)));
                }
            }
        });

        Ok(outcome_rx)
    }

    /// Completes a pending request with its response or error, waking the waiter.
    pub async fn complete(&self, id: &RequestId, outcome: Outcome) {
        if let Some(tx) = self.pending.lock().await.remove(id) {
            let _ = tx.send(outcome);
        }
    }

    /// Local cancellation path: wakes the waiter with a cancelled outcome and
    /// removes the slot. The caller is responsible for sending
    /// `notifications/cancelled` to the peer (spec.md §4.3, §5) — this only
    /// tears down the local bookkeeping.
    pub async fn cancel_local(&self, id: &RequestId, reason: &str) {
        if let Some(tx) = self.pending.lock().await.remove(id) {
            let _ = tx.send(Outcome::Cancelled {
                reason: reason.to_string(),
            });
        }
    }

    /// Wakes every outstanding waiter with a terminal disconnect, used when
    /// the transport closes (spec.md §5).
    pub async fn fail_all(&self) {
        let mut guard = self.pending.lock().await;
        for (_, tx) in guard.drain() {
            // Dropping the sender makes the spawned timeout task observe a
            // closed channel and resolve to `Disconnected` on its own; an
            // explicit send is unnecessary and would race the drop.
            drop(tx);
        }
    }

    pub async fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_registered_request() {
        let correlator = Correlator::new();
        let id = RequestId::Number(1);
        let rx = correlator
            .register(id.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        correlator.complete(&id, Outcome::Result(json!({"ok": true}))).await;
        let outcome = rx.await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Result(v) if v == json!({"ok": true})));
    }

    #[tokio::test]
    async fn duplicate_registration_fails_until_completed() {
        let correlator = Correlator::new();
        let id = RequestId::Number(1);
        let _rx = correlator
            .register(id.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let second = correlator.register(id.clone(), Duration::from_secs(5)).await;
        assert!(matches!(second, Err(McpError::DuplicateId(_))));

        correlator.complete(&id, Outcome::Result(Value::Null)).await;
        let third = correlator.register(id.clone(), Duration::from_secs(5)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn times_out_when_uncompleted() {
        let correlator = Correlator::new();
        let id = RequestId::Number(1);
        let rx = correlator
            .register(id.clone(), Duration::from_millis(20))
            .await
            .unwrap();
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(McpError::Timeout(_, _))));
        assert!(!correlator.is_pending(&id).await);
    }

    #[tokio::test]
    async fn local_cancel_wakes_waiter() {
        let correlator = Correlator::new();
        let id = RequestId::Number(7);
        let rx = correlator
            .register(id.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        correlator.cancel_local(&id, "user").await;
        let outcome = rx.await.unwrap().unwrap();
        match outcome {
            Outcome::Cancelled { reason } => assert_eq!(reason, "user"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
