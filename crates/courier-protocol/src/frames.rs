//! Frame types for the Courier client protocol.
//!
//! A session exchanges frames with exactly one client. Inbound frames carry
//! commands (`send`, `history`, `mark_read`, keepalive); outbound frames carry
//! fan-out deliveries and replies to those commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Event, Message, Notification};

/// Current client protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame kinds, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Send,
    History,
    MarkRead,
    Ping,
    Pong,
    Connected,
    Message,
    Notification,
    HistoryResult,
    Ack,
    Error,
}

impl FrameType {
    /// Whether frames of this type travel client to server.
    #[must_use]
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            FrameType::Send
                | FrameType::History
                | FrameType::MarkRead
                | FrameType::Ping
                | FrameType::Pong
        )
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Post content into the session's topic.
    #[serde(rename = "send")]
    Send {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Raw (unsanitized) text.
        content: String,
        /// Optional direct receiver.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
        /// Optional type tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },

    /// Fetch entities older than `before`.
    #[serde(rename = "history")]
    History {
        /// Request ID.
        id: u64,
        /// Upper bound (exclusive) on creation time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<DateTime<Utc>>,
        /// Maximum number of entities.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Mark one of the caller's notifications as read.
    #[serde(rename = "mark_read")]
    MarkRead {
        /// Request ID.
        id: u64,
        /// Notification to mark.
        notification_id: Uuid,
    },

    /// Application-level keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Application-level keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Session established.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Topic the session is registered on.
        topic: String,
        /// Negotiated protocol version.
        version: u8,
        /// Server keepalive interval in milliseconds.
        heartbeat: u32,
    },

    /// A chat message delivery.
    #[serde(rename = "message")]
    Message {
        /// The delivered message.
        message: Message,
    },

    /// A notification delivery.
    #[serde(rename = "notification")]
    Notification {
        /// The delivered notification.
        notification: Notification,
    },

    /// Reply to a `history` request, oldest first.
    #[serde(rename = "history_result")]
    HistoryResult {
        /// ID of the request.
        id: u64,
        /// Entities in chronological order.
        items: Vec<Event>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
        /// Resulting entity, if the request produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<Event>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Send { .. } => FrameType::Send,
            Frame::History { .. } => FrameType::History,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Message { .. } => FrameType::Message,
            Frame::Notification { .. } => FrameType::Notification,
            Frame::HistoryResult { .. } => FrameType::HistoryResult,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(content: impl Into<String>) -> Self {
        Frame::Send {
            id: None,
            content: content.into(),
            receiver_id: None,
            kind: None,
        }
    }

    /// Create a new Send frame with ID for acknowledgment.
    #[must_use]
    pub fn send_with_ack(id: u64, content: impl Into<String>) -> Self {
        Frame::Send {
            id: Some(id),
            content: content.into(),
            receiver_id: None,
            kind: None,
        }
    }

    /// Create a new History request frame.
    #[must_use]
    pub fn history(id: u64, before: Option<DateTime<Utc>>, limit: Option<u32>) -> Self {
        Frame::History { id, before, limit }
    }

    /// Create a new MarkRead frame.
    #[must_use]
    pub fn mark_read(id: u64, notification_id: Uuid) -> Self {
        Frame::MarkRead {
            id,
            notification_id,
        }
    }

    /// Wrap a fanned-out event for delivery.
    #[must_use]
    pub fn deliver(event: &Event) -> Self {
        match event {
            Event::Message(message) => Frame::Message {
                message: message.clone(),
            },
            Event::Notification(notification) => Frame::Notification {
                notification: notification.clone(),
            },
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id, event: None }
    }

    /// Create a new Ack frame carrying the resulting entity.
    #[must_use]
    pub fn ack_with(id: u64, event: impl Into<Event>) -> Self {
        Frame::Ack {
            id,
            event: Some(event.into()),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        topic: impl Into<String>,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            topic: topic.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}
