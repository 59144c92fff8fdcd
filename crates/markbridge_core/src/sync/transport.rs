//! Transport abstraction for the bridge WebSocket.
//!
//! The session manager drives a `Transport` without knowing the
//! backend: production uses `TokioTransport` (tokio-tungstenite), tests
//! use a scripted in-memory transport. The wire speaks UTF-8 JSON text
//! frames only.

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A send failed mid-session.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// A received WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    /// A text frame (JSON envelope).
    Text(String),
    /// Protocol-level ping.
    Ping(Vec<u8>),
    /// Protocol-level pong.
    Pong(Vec<u8>),
    /// The peer closed, with the close code when given.
    Close(Option<u16>, String),
}

/// An open WebSocket connection.
#[async_trait]
pub trait Transport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a protocol-level ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Receive the next message; `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Creates `Transport` connections.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The connection type produced.
    type Transport: Transport;

    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Self::Transport, TransportError>;
}
