//! Progress tokens and `notifications/progress` payloads (spec.md §3, §4.7).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::RequestId;

/// Opaque, caller-chosen token attached to `_meta.progressToken` of an
/// outbound request to request progress updates for that request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl From<RequestId> for ProgressToken {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Number(n) => ProgressToken::Number(n),
            RequestId::String(s) => ProgressToken::String(s),
        }
    }
}

/// Payload of a `notifications/progress` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressNotification {
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Tracks the last-reported progress value per token so a handler can assert
/// the monotonically-nondecreasing invariant from spec.md §4.7 if it wants to;
/// the engine itself does not reject a regressing value, it only exposes one.
/// Also holds, per token, the channel a caller subscribed on via
/// [`Session::call_with_progress`](crate::session::Session::call_with_progress)
/// so inbound `notifications/progress` can be routed back to it.
#[derive(Default)]
pub struct ProgressTracker {
    last: std::collections::HashMap<ProgressToken, f64>,
    subscribers: std::collections::HashMap<ProgressToken, mpsc::UnboundedSender<ProgressNotification>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a progress value, returning `false` if it regressed.
    fn record(&mut self, token: &ProgressToken, progress: f64) -> bool {
        let monotonic = match self.last.get(token) {
            Some(&prev) => progress >= prev,
            None => true,
        };
        self.last.insert(token.clone(), progress);
        monotonic
    }

    /// Registers interest in progress updates carrying `token`, returning the
    /// receiving half of the channel they'll arrive on.
    pub fn subscribe(&mut self, token: ProgressToken) -> mpsc::UnboundedReceiver<ProgressNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(token, tx);
        rx
    }

    /// Routes an inbound `notifications/progress` to its subscriber, if any,
    /// after checking (and recording) the monotonic invariant.
    pub fn dispatch(&mut self, notification: ProgressNotification) {
        if !self.record(&notification.progress_token, notification.progress) {
            debug!(token = ?notification.progress_token, "progress value regressed");
        }
        if let Some(tx) = self.subscribers.get(&notification.progress_token) {
            let _ = tx.send(notification);
        }
    }

    /// Retires a token once its request's terminal reply has been delivered.
    pub fn retire(&mut self, token: &ProgressToken) {
        self.last.remove(token);
        self.subscribers.remove(token);
    }
}

/// Extracts `_meta.progressToken` from a request's meta object, if present.
pub fn token_from_meta(meta: &Option<Value>) -> Option<ProgressToken> {
    meta.as_ref()
        .and_then(|m| m.get("progressToken"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_subscriber_and_detects_regression() {
        let mut tracker = ProgressTracker::new();
        let token = ProgressToken::String("p".into());
        let mut rx = tracker.subscribe(token.clone());

        tracker.dispatch(ProgressNotification {
            progress_token: token.clone(),
            progress: 0.3,
            total: None,
            message: None,
        });
        assert_eq!(rx.recv().await.unwrap().progress, 0.3);

        assert!(tracker.record(&token, 0.5));
        assert!(!tracker.record(&token, 0.1));

        tracker.retire(&token);
        tracker.dispatch(ProgressNotification {
            progress_token: token,
            progress: 0.9,
            total: None,
            message: None,
        });
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn extracts_token_from_meta() {
        let meta = Some(serde_json::json!({"progressToken": "abc"}));
        assert_eq!(token_from_meta(&meta), Some(ProgressToken::String("abc".into())));
        assert_eq!(token_from_meta(&None), None);
    }
}
