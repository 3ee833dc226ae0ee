//! TCP peer mesh.
//!
//! Each process listens on one address and keeps an outbound link to every
//! configured peer. A published payload is queued on every peer link without
//! waiting; a link whose queue is full reports a publish error instead of
//! blocking the caller. Links reconnect on failure, and whatever was in
//! flight on a broken link is lost.
//!
//! Frames are length-delimited: `[u16 subject length][subject][payload]`.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackplaneStream, BackplaneTransport};
use crate::traits::TransportError;

/// Largest mesh frame accepted from a peer.
const MAX_MESH_FRAME: usize = 2 * 1024 * 1024;

/// Mesh configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address to accept peer links on; `None` makes this process publish-only.
    pub listen: Option<SocketAddr>,
    /// Peers to publish to.
    pub peers: Vec<SocketAddr>,
    /// Frames buffered per peer link before publishes start failing.
    pub peer_queue_capacity: usize,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Frames buffered for local subscribers.
    pub inbound_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            peer_queue_capacity: 4096,
            reconnect_delay: Duration::from_secs(1),
            inbound_capacity: 4096,
        }
    }
}

struct PeerLink {
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// A TCP mesh transport.
pub struct TcpMesh {
    links: Vec<PeerLink>,
    inbound: broadcast::Sender<(Arc<str>, Bytes)>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
}

impl TcpMesh {
    /// Bind the listener (if any) and start one link task per peer.
    ///
    /// All background tasks stop when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if binding the listen address fails.
    pub async fn start(config: MeshConfig, cancel: CancellationToken) -> Result<Self, TransportError> {
        // Dropping the mesh stops its own tasks without cancelling the caller's token.
        let cancel = cancel.child_token();
        let (inbound, _)= broadcast::channel(config.inbound_capacity.max(1));

        let local_addr = match config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                info!("Mesh listening on {}", local);
                tokio::spawn(accept_loop(listener, inbound.clone(), cancel.clone()));
                Some(local)
            }
            None => None,
        };

        let links = config
            .peers
            .iter()
            .map(|&addr| {
                let (tx, rx) = mpsc::channel(config.peer_queue_capacity.max(1));
                tokio::spawn(peer_link(addr, rx, config.reconnect_delay, cancel.clone()));
                PeerLink { addr, tx }
            })
            .collect();

        Ok(Self {
            links,
            inbound,
            local_addr,
            cancel,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of configured peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.links.len()
    }
}

impl Drop for TcpMesh {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BackplaneTransport for TcpMesh {
    fn name(&self) -> &'static str {
        "mesh"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        let frame = encode_frame(subject, &payload)?;
        let mut first_error = None;

        for link in &self.links {
            let result = link.tx.try_send(frame.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::QueueFull(link.addr.to_string())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            });
            if let Err(e) = result {
                warn!(peer = %link.addr, error = %e, "Mesh publish failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BackplaneStream>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(Box::new(MeshStream {
            subject: subject.into(),
            rx: self.inbound.subscribe(),
            cancel: self.cancel.clone(),
        }))
    }
}

struct MeshStream {
    subject: Arc<str>,
    rx: broadcast::Receiver<(Arc<str>, Bytes)>,
    cancel: CancellationToken,
}

#[async_trait]
impl BackplaneStream for MeshStream {
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let received = tokio::select! {
                r = self.rx.recv() => r,
                () = self.cancel.cancelled() => return Ok(None),
            };
            match received {
                Ok((subject, payload)) if subject == self.subject => return Ok(Some(payload)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subject = %self.subject, skipped, "Mesh subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

fn encode_frame(subject: &str, payload: &[u8]) -> Result<Bytes, TransportError> {
    let subject_len = u16::try_from(subject.len())
        .map_err(|_| TransportError::Other(format!("subject too long: {} bytes", subject.len())))?;
    let mut buf = BytesMut::with_capacity(2 + subject.len() + payload.len());
    buf.put_u16(subject_len);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn decode_frame(mut frame: BytesMut) -> Result<(Arc<str>, Bytes), TransportError> {
    if frame.len() < 2 {
        return Err(TransportError::ReceiveFailed("mesh frame too short".into()));
    }
    let subject_len = frame.get_u16() as usize;
    if frame.len() < subject_len {
        return Err(TransportError::ReceiveFailed("mesh subject truncated".into()));
    }
    let subject = frame.split_to(subject_len);
    let subject = std::str::from_utf8(&subject)
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    Ok((Arc::from(subject), frame.freeze()))
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESH_FRAME)
        .new_codec()
}

async fn accept_loop(
    listener: TcpListener,
    inbound: broadcast::Sender<(Arc<str>, Bytes)>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "Mesh peer connected");
                tokio::spawn(peer_reader(stream, addr, inbound.clone(), cancel.clone()));
            }
            Err(e) => warn!(error = %e, "Mesh accept failed"),
        }
    }
    debug!("Mesh accept loop stopped");
}

async fn peer_reader(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: broadcast::Sender<(Arc<str>, Bytes)>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, codec());
    loop {
        let next = tokio::select! {
            n = frames.next() => n,
            () = cancel.cancelled() => break,
        };
        match next {
            Some(Ok(frame)) => match decode_frame(frame) {
                Ok(item) => {
                    // No local subscribers is fine.
                    let _ = inbound.send(item);
                }
                Err(e) => warn!(peer = %addr, error = %e, "Dropping malformed mesh frame"),
            },
            Some(Err(e)) => {
                warn!(peer = %addr, error = %e, "Mesh peer read failed");
                break;
            }
            None => break,
        }
    }
    debug!(peer = %addr, "Mesh peer disconnected");
}

async fn peer_link(
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    'connect: loop {
        let connected = tokio::select! {
            c = TcpStream::connect(addr) => c,
            () = cancel.cancelled() => break,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %addr, error = %e, "Mesh connect failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(reconnect_delay) => continue 'connect,
                    () = cancel.cancelled() => break,
                }
            }
        };
        info!(peer = %addr, "Mesh link established");

        let mut writer = FramedWrite::new(stream, codec());
        loop {
            let frame = tokio::select! {
                f = rx.recv() => f,
                () = cancel.cancelled() => break 'connect,
            };
            let Some(frame) = frame else { break 'connect };
            if let Err(e) = writer.send(frame).await {
                warn!(peer = %addr, error = %e, "Mesh link write failed, reconnecting");
                continue 'connect;
            }
        }
    }
    debug!(peer = %addr, "Mesh link stopped");
}
