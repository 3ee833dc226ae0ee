//! Transport abstraction traits for Courier.
//!
//! A client connection is consumed by a session as two independent halves:
//! a [`FrameSource`] driven by the reader loop and a [`FrameSink`] driven by
//! the writer loop.

use async_trait::async_trait;
use courier_protocol::Frame;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A bounded outbound queue had no room.
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The inbound half of a client connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection was closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The outbound half of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Emit a transport-level keepalive ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A live, already-authenticated client connection.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned reader and writer halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}
