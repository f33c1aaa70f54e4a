//! Transport abstraction: a polymorphic byte channel the session reads
//! `Message`s from and writes `Message`s to (spec.md §4.2).

#[cfg(feature = "http")]
pub mod http_sse;
pub mod in_memory;
#[cfg(feature = "stdio")]
pub mod stdio;

use async_trait::async_trait;

use crate::error::McpError;
use crate::wire::Message;

/// Common contract every transport implements. `recv` returning `Ok(None)`
/// means the peer closed the connection cleanly; an `Err` is a terminal
/// transport failure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), McpError>;
    async fn recv(&self) -> Result<Option<Message>, McpError>;
    async fn close(&self) -> Result<(), McpError>;
}
