//! A bidirectional JSON-RPC protocol engine implementing the Model Context
//! Protocol (MCP): session handshake and state machine, request/response
//! correlation, capability negotiation, feature registries (tools, prompts,
//! resources, roots), and pluggable transports (stdio, HTTP+SSE, in-memory).
//!
//! Embedders drive either direction through [`client::Client`] or
//! [`server::Server`], both built on the shared [`session::Session`].

pub mod client;
pub mod config;
pub mod content;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod methods;
pub mod progress;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;
pub mod uri_template;
pub mod wire;

pub use client::Client;
pub use error::{McpError, Result};
pub use server::Server;
pub use session::{Role, Session, SessionState};
pub use transport::Transport;
pub use wire::{Message, RequestId};
