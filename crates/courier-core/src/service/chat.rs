//! Chat rooms.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_protocol::model::DEFAULT_MESSAGE_KIND;
use courier_protocol::{Event, Frame, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{clamp_limit, error_frame, fan_out, validate_content, validate_id, validate_kind, SendRequest};
use crate::auth::Actor;
use crate::backplane::Backplane;
use crate::error::ServiceError;
use crate::hub::{Hub, Topic};
use crate::metrics;
use crate::recall::RecallCache;
use crate::sanitize::Sanitizer;
use crate::session::{SessionContext, SessionHandler};
use crate::store::MessageStore;

/// Chat service configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Maximum message length in characters, before sanitization.
    pub max_content_length: usize,
    /// History page size when the caller gives none.
    pub default_history_limit: usize,
    /// Largest history page a caller may request.
    pub max_history_limit: usize,
    /// Whether the last message per room is cached for joiners.
    pub recall_enabled: bool,
    /// Lifetime of a recalled message.
    pub recall_ttl: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_content_length: 4000,
            default_history_limit: 50,
            max_history_limit: 100,
            recall_enabled: true,
            recall_ttl: Duration::from_secs(3600),
        }
    }
}

/// Sends and reads chat messages.
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    recall: Option<Arc<dyn RecallCache>>,
    hub: Arc<Hub>,
    backplane: Arc<Backplane>,
    sanitizer: Sanitizer,
    config: ChatConfig,
}

fn recall_key(room_id: &str) -> String {
    format!("recall:{}", Topic::room(room_id))
}

impl ChatService {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        hub: Arc<Hub>,
        backplane: Arc<Backplane>,
        config: ChatConfig,
    ) -> Self {
        Self {
            store,
            recall: None,
            hub,
            backplane,
            sanitizer: Sanitizer::strict(),
            config,
        }
    }

    /// Attach a recall cache.
    #[must_use]
    pub fn with_recall(mut self, cache: Arc<dyn RecallCache>) -> Self {
        self.recall = Some(cache);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Post a message into a room.
    ///
    /// # Errors
    ///
    /// Validation, authorization and sanitization failures are returned
    /// before anything is stored. A store failure is returned as
    /// [`ServiceError::Store`] and nothing is broadcast.
    pub async fn send(
        &self,
        actor: &Actor,
        room_id: &str,
        request: SendRequest,
    ) -> Result<Message, ServiceError> {
        validate_id("room_id", room_id)?;
        validate_content(&request.content, self.config.max_content_length)?;
        if let Some(receiver) = &request.receiver_id {
            validate_id("receiver_id", receiver)?;
        }
        let kind = request.kind.as_deref().unwrap_or(DEFAULT_MESSAGE_KIND);
        validate_kind(kind)?;

        if !actor.can_post(room_id, request.receiver_id.as_deref()) {
            return Err(ServiceError::Forbidden(format!(
                "{} may not post to room {room_id}",
                actor.id
            )));
        }

        let content = self.sanitizer.clean(&request.content);
        if content.is_empty() {
            return Err(ServiceError::EmptyContent);
        }

        let mut message = Message::new(actor.id.clone(), room_id, content).with_kind(kind);
        if let Some(receiver) = request.receiver_id {
            message = message.with_receiver(receiver);
        }

        self.store.create_message(&message).await?;
        metrics::record_sent("message");
        debug!(room = room_id, sender = %actor.id, message = %message.id, "Message stored");

        self.remember(&message).await;
        fan_out(&self.hub, &self.backplane, message.clone().into()).await;
        Ok(message)
    }

    /// Messages of a room older than `before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid room id or a store failure.
    pub async fn history(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, ServiceError> {
        validate_id("room_id", room_id)?;
        let limit = clamp_limit(
            limit,
            self.config.default_history_limit,
            self.config.max_history_limit,
        );
        Ok(self.store.list_messages(room_id, before, limit).await?)
    }

    /// The last message posted to a room, if still cached.
    ///
    /// Cache failures and undecodable entries are treated as a miss.
    pub async fn recall(&self, room_id: &str) -> Option<Message> {
        let cache = self.recall.as_ref().filter(|_| self.config.recall_enabled)?;
        let raw = match cache.get(&recall_key(room_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(room = room_id, error = %e, "Recall lookup failed");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(room = room_id, error = %e, "Ignoring undecodable recall entry");
                None
            }
        }
    }

    async fn remember(&self, message: &Message) {
        let Some(cache) = self.recall.as_ref().filter(|_| self.config.recall_enabled) else {
            return;
        };
        let value = match serde_json::to_vec(message) {
            Ok(value) => Bytes::from(value),
            Err(e) => {
                warn!(error = %e, "Failed to encode recall entry");
                return;
            }
        };
        if let Err(e) = cache
            .set(&recall_key(&message.room_id), value, self.config.recall_ttl)
            .await
        {
            warn!(room = %message.room_id, error = %e, "Recall update failed");
        }
    }
}

#[async_trait]
impl SessionHandler for ChatService {
    async fn on_join(&self, ctx: &SessionContext) -> Vec<Frame> {
        let Topic::Room(room) = &ctx.topic else {
            return Vec::new();
        };
        self.recall(room)
            .await
            .map(|message| Frame::deliver(&message.into()))
            .into_iter()
            .collect()
    }

    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Option<Frame> {
        let Topic::Room(room) = &ctx.topic else {
            return Some(error_frame(None, &ServiceError::Unsupported("not a chat session")));
        };

        match frame {
            Frame::Send {
                id,
                content,
                receiver_id,
                kind,
            } => {
                let request = SendRequest {
                    content,
                    receiver_id,
                    kind,
                };
                match self.send(&ctx.actor, room, request).await {
                    Ok(message) => id.map(|id| Frame::ack_with(id, message)),
                    Err(e) => Some(error_frame(id, &e)),
                }
            }
            Frame::History { id, before, limit } => Some(match self.history(room, before, limit).await {
                Ok(items) => Frame::HistoryResult {
                    id,
                    items: items.into_iter().map(Event::from).collect(),
                },
                Err(e) => error_frame(Some(id), &e),
            }),
            Frame::MarkRead { id, .. } => Some(error_frame(
                Some(id),
                &ServiceError::Unsupported("mark_read on a chat session"),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::backplane::BackplaneConfig;
    use crate::recall::MemoryRecallCache;
    use crate::session::{Session, SessionConfig};
    use crate::store::{MemoryStore, StoreError};
    use courier_transport::memory::{pair, MemoryPeer};
    use courier_transport::MemoryBus;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(1);

    struct Fixture {
        chat: Arc<ChatService>,
        store: Arc<MemoryStore>,
        hub: Arc<Hub>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new());
        let chat = ChatService::new(
            store.clone(),
            hub.clone(),
            Arc::new(Backplane::disabled()),
            ChatConfig::default(),
        )
        .with_recall(Arc::new(MemoryRecallCache::new()));
        Fixture {
            chat: Arc::new(chat),
            store,
            hub,
        }
    }

    fn admin(id: &str) -> Actor {
        Actor::new(id, Role::Admin)
    }

    #[tokio::test]
    async fn test_send_persists_sanitized_content_and_broadcasts() {
        let f = fixture();
        let (tx, mut rx) = f.hub.channel();
        f.hub.register(Topic::room("r1"), tx);

        let message = f
            .chat
            .send(&admin("alice"), "r1", SendRequest::text("<b>hello</b> there"))
            .await
            .unwrap();
        assert_eq!(message.content, "hello there");
        assert_eq!(message.kind, DEFAULT_MESSAGE_KIND);

        let stored = f.chat.history("r1", None, None).await.unwrap();
        assert_eq!(stored, vec![message.clone()]);

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.id(), message.id);
    }

    #[tokio::test]
    async fn test_empty_after_sanitization_has_no_side_effects() {
        let f = fixture();
        let (tx, mut rx) = f.hub.channel();
        f.hub.register(Topic::room("r1"), tx);

        let err = f
            .chat
            .send(&admin("alice"), "r1", SendRequest::text("<script>alert(1)</script>"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmptyContent));
        assert!(err.is_validation());
        assert_eq!(f.store.message_count(), 0);
        assert!(rx.try_recv().is_err());
        assert!(f.chat.recall("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_sender_rejected_before_store() {
        let f = fixture();
        let (tx, mut rx) = f.hub.channel();
        f.hub.register(Topic::room("general"), tx);

        let err = f
            .chat
            .send(&Actor::user("bob"), "general", SendRequest::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert_eq!(f.store.message_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_may_post_into_own_direct_room() {
        let f = fixture();
        let message = f
            .chat
            .send(
                &Actor::user("alice"),
                "dm:alice_bob",
                SendRequest::text("hey").with_receiver("bob"),
            )
            .await
            .unwrap();
        assert_eq!(message.receiver_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let f = fixture();
        let actor = admin("alice");

        let too_long = "x".repeat(ChatConfig::default().max_content_length + 1);
        for (room, request) in [
            ("", SendRequest::text("hi")),
            ("r1", SendRequest::text("   ")),
            ("r1", SendRequest::text(too_long)),
            ("r1", SendRequest::text("hi").with_kind("bad kind")),
        ] {
            let err = f.chat.send(&actor, room, request).await.unwrap_err();
            assert!(err.is_validation(), "expected validation error, got {err}");
        }
        assert_eq!(f.store.message_count(), 0);
    }

    struct DownStore;

    #[async_trait]
    impl MessageStore for DownStore {
        async fn create_message(&self, _message: &Message) -> Result<uuid::Uuid, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn list_messages(
            &self,
            _room_id: &str,
            _before: Option<DateTime<Utc>>,
            _limit: usize,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates_without_broadcast() {
        let hub = Arc::new(Hub::new());
        let chat = ChatService::new(
            Arc::new(DownStore),
            hub.clone(),
            Arc::new(Backplane::disabled()),
            ChatConfig::default(),
        );
        let (tx, mut rx) = hub.channel();
        hub.register(Topic::room("r1"), tx);

        let err = chat
            .send(&admin("alice"), "r1", SendRequest::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(_)));
        assert_eq!(err.code(), 500);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recall_holds_last_message() {
        let f = fixture();
        let actor = admin("alice");
        f.chat.send(&actor, "r1", SendRequest::text("first")).await.unwrap();
        f.chat.send(&actor, "r1", SendRequest::text("second")).await.unwrap();

        assert_eq!(f.chat.recall("r1").await.unwrap().content, "second");
        assert!(f.chat.recall("r2").await.is_none());
    }

    #[tokio::test]
    async fn test_recall_disabled() {
        let chat = ChatService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Hub::new()),
            Arc::new(Backplane::disabled()),
            ChatConfig {
                recall_enabled: false,
                ..ChatConfig::default()
            },
        )
        .with_recall(Arc::new(MemoryRecallCache::new()));
        chat.send(&admin("alice"), "r1", SendRequest::text("hi"))
            .await
            .unwrap();
        assert!(chat.recall("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_history_limit_clamped() {
        let f = fixture();
        let actor = admin("alice");
        for i in 0..5 {
            f.chat
                .send(&actor, "r1", SendRequest::text(i.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(f.chat.history("r1", None, Some(0)).await.unwrap().len(), 1);
        let all = f.chat.history("r1", None, Some(1000)).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["0", "1", "2", "3", "4"]);
    }

    fn join(f: &Fixture, actor: Actor, room: &str) -> (Session, MemoryPeer) {
        let (conn, peer) = pair(16);
        let session = Session::start(
            Box::new(conn),
            actor,
            Topic::room(room),
            f.hub.clone(),
            f.chat.clone(),
            &SessionConfig::default(),
        );
        (session, peer)
    }

    async fn next_frame(peer: &mut MemoryPeer) -> Frame {
        timeout(WAIT, peer.next_frame()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_two_subscribers_receive_one_message() {
        let f = fixture();
        let (_a, mut peer_a) = join(&f, admin("alice"), "r1");
        let (_b, mut peer_b) = join(&f, Actor::user("bob"), "r1");
        assert!(matches!(next_frame(&mut peer_a).await, Frame::Connected { .. }));
        assert!(matches!(next_frame(&mut peer_b).await, Frame::Connected { .. }));

        peer_a.send(Frame::send("hello")).await.unwrap();

        for peer in [&mut peer_a, &mut peer_b] {
            match next_frame(peer).await {
                Frame::Message { message } => {
                    assert_eq!(message.content, "hello");
                    assert_eq!(message.sender_id, "alice");
                }
                other => panic!("unexpected frame {other:?}"),
            }
            assert!(peer.try_recv().is_none());
        }

        let rows = f.chat.history("r1", None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].room_id, "r1");
        assert_eq!(rows[0].content, "hello");
    }

    #[tokio::test]
    async fn test_session_errors_and_history() {
        let f = fixture();
        let (_s, mut peer) = join(&f, Actor::user("bob"), "general");
        next_frame(&mut peer).await;

        peer.send(Frame::send_with_ack(1, "hi")).await.unwrap();
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Error { id: 1, code: 403, .. }
        ));

        peer.send(Frame::history(2, None, None)).await.unwrap();
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::HistoryResult { id: 2, ref items } if items.is_empty()
        ));

        peer.send(Frame::mark_read(3, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Error { id: 3, code: 405, .. }
        ));
    }

    #[tokio::test]
    async fn test_join_primes_with_recalled_message() {
        let f = fixture();
        f.chat
            .send(&admin("alice"), "r1", SendRequest::text("earlier"))
            .await
            .unwrap();

        let (_s, mut peer) = join(&f, Actor::user("bob"), "r1");
        assert!(matches!(next_frame(&mut peer).await, Frame::Connected { .. }));
        assert!(matches!(
            next_frame(&mut peer).await,
            Frame::Message { ref message } if message.content == "earlier"
        ));
    }

    #[tokio::test]
    async fn test_replicated_across_processes_without_duplicates() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();

        let mut nodes = Vec::new();
        for _ in 0..2 {
            let hub = Arc::new(Hub::new());
            let backplane =
                Arc::new(Backplane::new(BackplaneConfig::default()).with_transport(bus.clone()));
            backplane.start(hub.clone(), cancel.clone()).await.unwrap();
            let chat = ChatService::new(
                Arc::new(MemoryStore::new()),
                hub.clone(),
                backplane,
                ChatConfig::default(),
            );
            let (tx, rx) = hub.channel();
            hub.register(Topic::room("r1"), tx);
            nodes.push((chat, rx));
        }

        let sent = nodes[0]
            .0
            .send(&admin("alice"), "r1", SendRequest::text("hello"))
            .await
            .unwrap();

        for (_, rx) in &mut nodes {
            let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(event.id(), sent.id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for (_, rx) in &mut nodes {
            assert!(rx.try_recv().is_err());
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_backplane_failure_does_not_fail_send() {
        use crate::service::testing::Unreachable;
        use std::sync::atomic::Ordering;

        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new());
        let transport = Arc::new(Unreachable::default());
        let backplane = Backplane::new(BackplaneConfig::default()).with_transport(transport.clone());
        let chat = ChatService::new(
            store.clone(),
            hub.clone(),
            Arc::new(backplane),
            ChatConfig::default(),
        );
        let (tx, mut rx) = hub.channel();
        hub.register(Topic::room("r1"), tx);

        let message = chat
            .send(&admin("alice"), "r1", SendRequest::text("still here"))
            .await
            .unwrap();

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.message_count(), 1);
        assert_eq!(rx.try_recv().unwrap().id(), message.id);
    }
}
