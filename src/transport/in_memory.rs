//! A paired, in-process transport used by integration tests to wire two
//! sessions together without touching a real byte channel.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::McpError;
use crate::transport::Transport;
use crate::wire::Message;

pub struct InMemoryTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl InMemoryTransport {
    /// Builds a connected pair: messages sent on one side arrive on `recv()`
    /// of the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            InMemoryTransport {
                tx: a_tx,
                rx: Mutex::new(a_rx),
            },
            InMemoryTransport {
                tx: b_tx,
                rx: Mutex::new(b_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: Message) -> Result<(), McpError> {
        self.tx
            .send(message)
            .map_err(|_| McpError::Disconnected)
    }

    async fn recv(&self) -> Result<Option<Message>, McpError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestId;

    #[tokio::test]
    async fn delivers_message_to_peer() {
        let (a, b) = InMemoryTransport::pair();
        a.send(Message::request(RequestId::Number(1), "ping", None))
            .await
            .unwrap();
        let received = b.recv().await.unwrap().unwrap();
        assert_eq!(received.method(), Some("ping"));
    }

    #[tokio::test]
    async fn closing_sender_yields_none_on_recv() {
        let (a, b) = InMemoryTransport::pair();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }
}
