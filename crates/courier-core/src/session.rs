//! Connection sessions.
//!
//! A [`Session`] owns one client connection registered on one hub topic.
//! It runs two tasks:
//!
//! - the reader decodes inbound frames and hands each one to the
//!   [`SessionHandler`], waiting for it before reading the next
//! - the writer forwards hub deliveries and handler replies to the client,
//!   and pings the client when nothing was written for a keepalive interval
//!
//! Either task ending closes the session. [`Session::close`] may be called
//! any number of times from anywhere; only the first call has an effect.

use async_trait::async_trait;
use courier_protocol::Frame;
use courier_transport::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::auth::Actor;
use crate::hub::{Hub, SubscriberReceiver, Subscription, Topic};
use crate::metrics::{self, ConnectionMetricsGuard};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the hub delivery buffer. Deliveries beyond it are dropped.
    pub outbound_capacity: usize,
    /// Capacity of the reply buffer between reader and writer.
    pub reply_capacity: usize,
    /// Idle time after which the writer pings the client.
    pub keepalive: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            reply_capacity: 32,
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Registered,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Who a session belongs to and where it is registered.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub connection_id: ConnectionId,
    pub actor: Actor,
    pub topic: Topic,
}

/// Processes the requests arriving on a session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Frames written right after the session is registered.
    async fn on_join(&self, _ctx: &SessionContext) -> Vec<Frame> {
        Vec::new()
    }

    /// Handle one inbound request, returning the reply for this client.
    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Option<Frame>;
}

struct Shared {
    ctx: SessionContext,
    hub: Arc<Hub>,
    subscription: Subscription,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    _metrics: ConnectionMetricsGuard,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(SessionState::Closing);
        self.hub.unregister(&self.subscription);
        self.cancel.cancel();
        debug!(connection = %self.ctx.connection_id, topic = %self.ctx.topic, "Session closing");
        true
    }
}

/// A live client session.
pub struct Session {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Register `connection` on `topic` and start its reader and writer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        connection: Box<dyn Connection>,
        actor: Actor,
        topic: Topic,
        hub: Arc<Hub>,
        handler: Arc<dyn SessionHandler>,
        config: &SessionConfig,
    ) -> Self {
        let metrics_guard = ConnectionMetricsGuard::new();
        let ctx = SessionContext {
            connection_id: connection.id().clone(),
            actor,
            topic: topic.clone(),
        };
        let state = AtomicU8::new(SessionState::Connecting as u8);
        debug!(
            connection = %ctx.connection_id,
            remote = ?connection.remote_addr(),
            actor = %ctx.actor,
            "Session connecting"
        );

        let (source, sink) = connection.split();
        let (event_tx, event_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (reply_tx, reply_rx) = mpsc::channel(config.reply_capacity.max(1));

        let subscription = hub.register(topic, event_tx);
        state.store(SessionState::Registered as u8, Ordering::Release);

        let shared = Arc::new(Shared {
            ctx,
            hub,
            subscription,
            state,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            _metrics: metrics_guard,
        });

        let writer = tokio::spawn(write_loop(
            Arc::clone(&shared),
            sink,
            event_rx,
            reply_rx,
            config.keepalive,
        ));
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), source, handler, reply_tx));

        // A task may already have failed and closed the session.
        let _ = shared.state.compare_exchange(
            SessionState::Registered as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(connection = %shared.ctx.connection_id, topic = %shared.ctx.topic, "Session active");

        Self {
            shared,
            reader,
            writer,
        }
    }

    /// The connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.ctx.connection_id
    }

    /// The session context.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.shared.ctx
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// Check if the session has begun closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the session. Returns `false` if it was already closing.
    ///
    /// Unregisters from the hub, which closes the delivery channel, and
    /// stops both tasks. A write in progress is abandoned. The writer then
    /// closes the connection on its way out, or drops it if the client has
    /// stopped reading.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Wait for both tasks to finish.
    pub async fn join(self) {
        for (task, handle) in [("reader", self.reader), ("writer", self.writer)] {
            if let Err(e) = handle.await {
                warn!(connection = %self.shared.ctx.connection_id, task, error = %e, "Session task failed");
                self.shared.close();
            }
        }
        self.shared.set_state(SessionState::Closed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.shared.ctx.connection_id)
            .field("topic", &self.shared.ctx.topic)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    handler: Arc<dyn SessionHandler>,
    replies: mpsc::Sender<Frame>,
) {
    let ctx = &shared.ctx;

    for frame in handler.on_join(ctx).await {
        if replies.send(frame).await.is_err() {
            shared.close();
            return;
        }
    }

    loop {
        let next = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break,
            next = source.recv() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(connection = %ctx.connection_id, "Client disconnected");
                break;
            }
            Err(e) => {
                metrics::record_error("transport");
                warn!(connection = %ctx.connection_id, error = %e, "Read failed");
                break;
            }
        };

        trace!(connection = %ctx.connection_id, frame = ?frame.frame_type(), "Received frame");
        let reply = match frame {
            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),
            Frame::Pong { .. } => None,
            frame if !frame.frame_type().is_inbound() => {
                Some(Frame::error(0, 400, "unexpected server frame"))
            }
            frame => handler.handle(ctx, frame).await,
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }

    shared.close();
}

/// Upper bound on the graceful close handshake once the writer stops.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

enum Write {
    Done(Result<(), TransportError>),
    Cancelled,
}

/// Run one write, abandoning it if the session closes first.
async fn write_or_cancel<F>(cancel: &CancellationToken, write: F) -> Write
where
    F: Future<Output = Result<(), TransportError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Write::Cancelled,
        result = write => Write::Done(result),
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: Box<dyn FrameSink>,
    mut events: SubscriberReceiver,
    mut replies: mpsc::Receiver<Frame>,
    keepalive: Duration,
) {
    let ctx = &shared.ctx;
    let cancel = &shared.cancel;
    let heartbeat = u32::try_from(keepalive.as_millis()).unwrap_or(u32::MAX);
    let connected = Frame::connected(ctx.connection_id.as_str(), ctx.topic.to_string(), heartbeat);

    let mut outcome = write_or_cancel(cancel, sink.send(&connected)).await;
    while let Write::Done(Ok(())) = outcome {
        outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(reply) = replies.recv() => write_or_cancel(cancel, sink.send(&reply)).await,
            event = events.recv() => match event {
                Some(event) => write_or_cancel(cancel, sink.send(&Frame::deliver(&event))).await,
                None => break,
            },
            () = tokio::time::sleep(keepalive) => {
                trace!(connection = %ctx.connection_id, "Keepalive ping");
                write_or_cancel(cancel, sink.ping()).await
            }
        };
    }

    shared.close();
    events.close();
    replies.close();
    match outcome {
        Write::Done(Err(e)) => {
            metrics::record_error("transport");
            warn!(connection = %ctx.connection_id, error = %e, "Write failed");
        }
        Write::Cancelled => {
            debug!(connection = %ctx.connection_id, "Write abandoned on close");
        }
        Write::Done(Ok(())) => {}
    }

    // A client that stopped reading cannot take a close frame; the sink is
    // dropped once the handshake times out.
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            trace!(connection = %ctx.connection_id, error = %e, "Close after shutdown");
        }
        Err(_) => {
            debug!(connection = %ctx.connection_id, "Close handshake timed out");
        }
    }
    drop(sink);
    shared.set_state(SessionState::Closed);
    debug!(connection = %ctx.connection_id, "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::{Event, Message};
    use courier_transport::memory::{pair, MemoryPeer, PeerEvent};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    /// Acks every send with its content echoed in an error-free ack.
    #[derive(Default)]
    struct Echo {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl SessionHandler for Echo {
        async fn on_join(&self, _ctx: &SessionContext) -> Vec<Frame> {
            vec![Frame::deliver(&Message::new("system", "r1", "welcome").into())]
        }

        async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Option<Frame> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            match frame {
                Frame::Send { id, content, .. } => id.map(|id| {
                    Frame::ack_with(id, Message::new(ctx.actor.id.clone(), ctx.topic.id(), content))
                }),
                _ => None,
            }
        }
    }

    fn start(hub: &Arc<Hub>, config: &SessionConfig) -> (Session, MemoryPeer, Arc<Echo>) {
        let (conn, peer) = pair(16);
        let handler = Arc::new(Echo::default());
        let session = Session::start(
            Box::new(conn),
            Actor::user("alice"),
            Topic::room("r1"),
            Arc::clone(hub),
            handler.clone(),
            config,
        );
        (session, peer, handler)
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        timeout(WAIT, peer.next_frame()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_connected_then_join_frames_then_deliveries() {
        let hub = Arc::new(Hub::new());
        let (session, mut peer, _) = start(&hub, &SessionConfig::default());
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(hub.subscriber_count(&Topic::room("r1")), 1);

        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Connected { ref topic, .. } if topic == "room:r1"
        ));
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Message { ref message } if message.content == "welcome"
        ));

        let event: Event = Message::new("bob", "r1", "hi").into();
        hub.broadcast(&Topic::room("r1"), Arc::new(event));
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Message { ref message } if message.sender_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let hub = Arc::new(Hub::new());
        let (_session, mut peer, handler) = start(&hub, &SessionConfig::default());
        next_frame(&mut peer).await;
        next_frame(&mut peer).await;

        peer.send(Frame::send_with_ack(1, "one")).await.unwrap();
        peer.send(Frame::send_with_ack(2, "two")).await.unwrap();
        peer.send(Frame::Ping { timestamp: Some(7) }).await.unwrap();

        assert!(matches!(next_frame(&mut peer).await, Frame::Ack { id: 1, .. }));
        assert!(matches!(next_frame(&mut peer).await, Frame::Ack { id: 2, .. }));
        assert_eq!(next_frame(&mut peer).await, Frame::pong(Some(7)));
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_frames_from_client_rejected() {
        let hub = Arc::new(Hub::new());
        let (_session, mut peer, handler) = start(&hub, &SessionConfig::default());
        next_frame(&mut peer).await;
        next_frame(&mut peer).await;

        peer.send(Frame::ack(3)).await.unwrap();
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Error { code: 400, .. }
        ));
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let hub = Arc::new(Hub::new());
        let (session, mut peer, _) = start(&hub, &SessionConfig::default());

        assert!(session.close());
        assert!(!session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(hub.stats().subscriber_count, 0);
        assert!(!hub.topic_exists(&Topic::room("r1")));

        session.join().await;
        let mut saw_closed = false;
        while let Some(event) = timeout(WAIT, peer.recv()).await.unwrap() {
            if event == PeerEvent::Closed {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_client_disconnect_closes_session() {
        let hub = Arc::new(Hub::new());
        let (session, mut peer, _) = start(&hub, &SessionConfig::default());
        peer.disconnect();

        timeout(WAIT, async {
            while session.state() != SessionState::Closed {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.stats().subscriber_count, 0);
        assert!(!session.close());
    }

    #[tokio::test]
    async fn test_read_error_closes_session() {
        let hub = Arc::new(Hub::new());
        let (session, peer, _) = start(&hub, &SessionConfig::default());
        peer.fail("garbled frame").await.unwrap();

        timeout(WAIT, session.join()).await.unwrap();
        assert_eq!(hub.stats().subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_when_idle() {
        let hub = Arc::new(Hub::new());
        let config = SessionConfig {
            keepalive: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let (_session, mut peer, _) = start(&hub, &config);
        next_frame(&mut peer).await;
        next_frame(&mut peer).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(peer.recv().await, Some(PeerEvent::Ping));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_for_slow_session_only() {
        let hub = Arc::new(Hub::new());
        let config = SessionConfig {
            outbound_capacity: 1,
            ..SessionConfig::default()
        };
        // The peer never reads, so the writer stalls on the memory pipe.
        let (conn, _peer) = pair(1);
        let session = Session::start(
            Box::new(conn),
            Actor::user("alice"),
            Topic::room("r1"),
            Arc::clone(&hub),
            Arc::new(Echo::default()),
            &config,
        );

        let topic = Topic::room("r1");
        let mut dropped = 0;
        for i in 0..10 {
            let event: Event = Message::new("bob", "r1", i.to_string()).into();
            dropped += hub.broadcast(&topic, Arc::new(event)).dropped;
            tokio::task::yield_now().await;
        }
        assert!(dropped > 0);
        assert!(session.close());
    }

    #[tokio::test]
    async fn test_close_with_stalled_writer_completes() {
        let hub = Arc::new(Hub::new());
        // The peer never reads, so the writer blocks once the pipe is full.
        let (conn, peer) = pair(1);
        let session = Session::start(
            Box::new(conn),
            Actor::user("alice"),
            Topic::room("r1"),
            Arc::clone(&hub),
            Arc::new(Echo::default()),
            &SessionConfig::default(),
        );

        let topic = Topic::room("r1");
        for i in 0..5 {
            let event: Event = Message::new("bob", "r1", i.to_string()).into();
            hub.broadcast(&topic, Arc::new(event));
            tokio::task::yield_now().await;
        }

        assert!(session.close());
        timeout(Duration::from_secs(2), session.join())
            .await
            .expect("writer stuck after close");
        assert_eq!(hub.stats().subscriber_count, 0);
        drop(peer);
    }
}
