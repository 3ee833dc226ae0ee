//! Broadcast services.
//!
//! [`ChatService`] and [`NotificationService`] share one pipeline:
//! validate, authorize, sanitize, persist, then fan out locally through the
//! hub and remotely through the backplane. Nothing is fanned out unless the
//! store accepted the entity. Both services also act as the
//! [`SessionHandler`](crate::session::SessionHandler) of their sessions.

use courier_protocol::{Event, Frame};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backplane::Backplane;
use crate::error::ServiceError;
use crate::hub::{validate_topic_id, Hub, Topic};
use crate::metrics;

pub mod chat;
pub mod notification;

pub use chat::{ChatConfig, ChatService};
pub use notification::{NotificationConfig, NotificationService};

/// Maximum length of an entity type tag.
pub const MAX_KIND_LENGTH: usize = 32;

/// Content and addressing of a new chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SendRequest {
    pub content: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl SendRequest {
    /// A plain text message.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

pub(crate) fn validate_id(field: &'static str, id: &str) -> Result<(), ServiceError> {
    validate_topic_id(id).map_err(|message| ServiceError::validation(field, message))
}

pub(crate) fn validate_content(content: &str, max_chars: usize) -> Result<(), ServiceError> {
    if content.trim().is_empty() {
        return Err(ServiceError::validation("content", "required"));
    }
    if content.chars().count() > max_chars {
        return Err(ServiceError::validation(
            "content",
            format!("longer than {max_chars} characters"),
        ));
    }
    Ok(())
}

pub(crate) fn validate_kind(kind: &str) -> Result<(), ServiceError> {
    if kind.is_empty() {
        return Err(ServiceError::validation("type", "required"));
    }
    if kind.len() > MAX_KIND_LENGTH {
        return Err(ServiceError::validation("type", "too long"));
    }
    if !kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ServiceError::validation("type", "invalid characters"));
    }
    Ok(())
}

/// Resolve a requested history page size.
pub(crate) fn clamp_limit(limit: Option<u32>, default: usize, max: usize) -> usize {
    limit.map_or(default, |l| l as usize).clamp(1, max.max(1))
}

/// Fan a persisted entity out locally, then to other processes.
///
/// A backplane failure is logged and counted; the entity is already durable
/// and delivered locally, so it is not reported to the caller.
pub(crate) async fn fan_out(hub: &Hub, backplane: &Backplane, event: Event) {
    let topic = Topic::for_event(&event);
    let event = Arc::new(event);
    let outcome = hub.broadcast(&topic, Arc::clone(&event));
    debug!(topic = %topic, delivered = outcome.delivered, dropped = outcome.dropped, "Fanned out");

    if let Err(e) = backplane.publish(&event).await {
        warn!(topic = %topic, event = %event.id(), error = %e, "Cross-process fan-out skipped");
    }
}

/// Convert a service failure into the error frame for request `id`.
pub(crate) fn error_frame(id: Option<u64>, err: &ServiceError) -> Frame {
    metrics::record_error(err.label());
    if matches!(err, ServiceError::Store(_)) {
        warn!(error = %err, "Request failed");
    } else {
        debug!(error = %err, "Request rejected");
    }
    Frame::error(id.unwrap_or(0), err.code(), err.to_string())
}
