//! In-process connection pair.
//!
//! [`pair`] returns a [`MemoryConnection`] to hand to a session and a
//! [`MemoryPeer`] that plays the client side. Useful for embedding the core
//! without a network listener, and for driving sessions in tests.

use async_trait::async_trait;
use courier_protocol::Frame;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

/// What the client side observes on an in-memory connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A frame written by the server.
    Frame(Frame),
    /// A transport-level keepalive ping.
    Ping,
    /// The server closed the connection.
    Closed,
}

/// Create a connected in-memory pair with the given buffer capacity per direction.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
    };
    (conn, peer)
}

/// The server side of an in-memory pair.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
    outbound: mpsc::Sender<PeerEvent>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (
            Box::new(MemorySource {
                inbound: self.inbound,
            }),
            Box::new(MemorySink {
                outbound: self.outbound,
                closed: false,
            }),
        )
    }
}

struct MemorySource {
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

struct MemorySink {
    outbound: mpsc::Sender<PeerEvent>,
    closed: bool,
}

impl MemorySink {
    async fn push(&mut self, event: PeerEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.push(PeerEvent::Frame(frame.clone())).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(PeerEvent::Ping).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        // The peer may already be gone; closing is still complete.
        let _ = self.outbound.send(PeerEvent::Closed).await;
        self.closed = true;
        Ok(())
    }
}

/// The client side of an in-memory pair.
pub struct MemoryPeer {
    inbound: Option<mpsc::Sender<Result<Frame, TransportError>>>,
    outbound: mpsc::Receiver<PeerEvent>,
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away or the peer disconnected.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.inbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the server's next read fail with a receive error.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.inbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(Err(TransportError::ReceiveFailed(reason.into())))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the client side; the server reads end-of-stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Receive the next event written by the server.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.outbound.recv().await
    }

    /// Receive the next frame, skipping keepalive pings.
    ///
    /// Returns `None` once the server closed the connection.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.outbound.recv().await? {
                PeerEvent::Frame(frame) => return Some(frame),
                PeerEvent::Ping => continue,
                PeerEvent::Closed => return None,
            }
        }
    }

    /// Take an already-written event without waiting.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.outbound.try_recv().ok()
    }
}
