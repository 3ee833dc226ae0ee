//! Entities delivered by Courier.
//!
//! A [`Message`] is a chat line posted into a room; a [`Notification`] is a
//! per-user event. Both are created once by the broadcast services and carried
//! unchanged over the hub, the backplane and the client wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default type tag for chat messages.
pub const DEFAULT_MESSAGE_KIND: &str = "text";

fn default_message_kind() -> String {
    DEFAULT_MESSAGE_KIND.to_string()
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: Uuid,
    /// Identity of the sender.
    pub sender_id: String,
    /// Optional direct receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    /// Room the message was posted into.
    pub room_id: String,
    /// Sanitized message text.
    pub content: String,
    /// Type tag (`text` unless stated otherwise).
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new text message stamped with the current time.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: None,
            room_id: room_id.into(),
            content: content.into(),
            kind: default_message_kind(),
            created_at: Utc::now(),
        }
    }

    /// Set the direct receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    /// Set the type tag.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// A user notification.
///
/// Everything but `read` (and `updated_at`, which follows it) is fixed at
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification identifier.
    pub id: Uuid,
    /// The user this notification is addressed to.
    pub user_id: String,
    /// Type tag, e.g. `mention` or `system`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sanitized notification text.
    pub content: String,
    /// Whether the user has read it.
    #[serde(default)]
    pub read: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Create a new unread notification.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind: kind.into(),
            content: content.into(),
            read: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Flip the read flag.
    ///
    /// Returns `true` only on the unread to read transition.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.updated_at = at;
        true
    }
}

/// Either entity, as fanned out by the hub and replicated by the backplane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    /// A chat message.
    Message(Message),
    /// A user notification.
    Notification(Notification),
}

impl Event {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::Notification(_) => "notification",
        }
    }

    /// Identifier of the wrapped entity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Event::Message(m) => m.id,
            Event::Notification(n) => n.id,
        }
    }
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        Event::Message(message)
    }
}

impl From<Notification> for Event {
    fn from(notification: Notification) -> Self {
        Event::Notification(notification)
    }
}
