//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into a [`Connection`]. Text messages
//! carry JSON frames, binary messages carry length-prefixed MessagePack.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use courier_protocol::{codec, Frame, ProtocolError, WireFormat};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    format: WireFormat,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket, writing outbound frames in `format`.
    #[must_use]
    pub fn new(socket: WebSocket, format: WireFormat) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            format,
            remote_addr: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Limit the size of a single inbound message.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.socket.split();
        let source = WebSocketSource {
            id: self.id,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: self.max_message_size,
        };
        let sink = WebSocketSink {
            sink,
            format: self.format,
        };
        (Box::new(source), Box::new(sink))
    }
}

struct WebSocketSource {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketSource {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                connection = %self.id,
                "Message too large: {} bytes (max: {})",
                len,
                self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode_text(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);
                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                // Pings are answered by the socket itself; pongs need no action.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    format: WireFormat,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let message = match self.format {
            WireFormat::Text => Message::Text(codec::encode_text(frame)?),
            WireFormat::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
