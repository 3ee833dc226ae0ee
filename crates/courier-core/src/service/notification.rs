//! Per-user notifications.
//!
//! Notifications fan out on the owner's [`Topic::User`]. Marking one read
//! fans the updated row out once, so the owner's other sessions can update
//! their unread state; repeated calls change nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{Event, Frame, Notification};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{clamp_limit, error_frame, fan_out, validate_content, validate_id, validate_kind};
use crate::auth::Actor;
use crate::backplane::Backplane;
use crate::error::ServiceError;
use crate::hub::{Hub, Topic};
use crate::metrics;
use crate::sanitize::Sanitizer;
use crate::session::{SessionContext, SessionHandler};
use crate::store::NotificationStore;

/// Type tag used when a session publishes without one.
pub const DEFAULT_NOTIFICATION_KIND: &str = "info";

/// Notification service configuration.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub max_content_length: usize,
    pub default_history_limit: usize,
    pub max_history_limit: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_content_length: 1000,
            default_history_limit: 50,
            max_history_limit: 100,
        }
    }
}

/// Publishes, lists and acknowledges notifications.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    hub: Arc<Hub>,
    backplane: Arc<Backplane>,
    sanitizer: Sanitizer,
    config: NotificationConfig,
}

impl NotificationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        hub: Arc<Hub>,
        backplane: Arc<Backplane>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            store,
            hub,
            backplane,
            sanitizer: Sanitizer::strict(),
            config,
        }
    }

    /// Publish a notification to `user_id`.
    ///
    /// The user need not be connected; the notification is stored and shows
    /// up in their history.
    ///
    /// # Errors
    ///
    /// Validation, authorization and sanitization failures are returned
    /// before anything is stored. A store failure is returned as
    /// [`ServiceError::Store`] and nothing is broadcast.
    pub async fn publish(
        &self,
        actor: &Actor,
        user_id: &str,
        kind: &str,
        content: &str,
    ) -> Result<Notification, ServiceError> {
        validate_id("user_id", user_id)?;
        validate_kind(kind)?;
        validate_content(content, self.config.max_content_length)?;

        if !actor.can_notify(user_id) {
            return Err(ServiceError::Forbidden(format!(
                "{} may not notify {user_id}",
                actor.id
            )));
        }

        let content = self.sanitizer.clean(content);
        if content.is_empty() {
            return Err(ServiceError::EmptyContent);
        }

        let notification = Notification::new(user_id, kind, content);
        self.store.create_notification(&notification).await?;
        metrics::record_sent("notification");
        debug!(user = user_id, notification = %notification.id, "Notification stored");

        fan_out(&self.hub, &self.backplane, notification.clone().into()).await;
        Ok(notification)
    }

    /// Notifications of a user older than `before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid user id or a store failure.
    pub async fn history(
        &self,
        user_id: &str,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Notification>, ServiceError> {
        validate_id("user_id", user_id)?;
        let limit = clamp_limit(
            limit,
            self.config.default_history_limit,
            self.config.max_history_limit,
        );
        Ok(self.store.list_notifications(user_id, before, limit).await?)
    }

    /// Mark one of `user_id`'s notifications read.
    ///
    /// Calling this on an already read notification returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the notification does not exist
    /// or belongs to someone else.
    pub async fn mark_read(&self, id: Uuid, user_id: &str) -> Result<Notification, ServiceError> {
        validate_id("user_id", user_id)?;
        let (notification, changed) = self.store.mark_read(id, user_id).await?;
        if changed {
            debug!(user = user_id, notification = %id, "Notification read");
            fan_out(&self.hub, &self.backplane, notification.clone().into()).await;
        }
        Ok(notification)
    }

    /// Number of unread notifications of a user.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid user id or a store failure.
    pub async fn unread_count(&self, user_id: &str) -> Result<usize, ServiceError> {
        validate_id("user_id", user_id)?;
        Ok(self.store.unread_count(user_id).await?)
    }
}

#[async_trait]
impl SessionHandler for NotificationService {
    async fn handle(&self, ctx: &SessionContext, frame: Frame) -> Option<Frame> {
        let Topic::User(user) = &ctx.topic else {
            return Some(error_frame(
                None,
                &ServiceError::Unsupported("not a notification session"),
            ));
        };

        match frame {
            Frame::Send {
                id,
                content,
                receiver_id,
                kind,
            } => {
                let target = receiver_id.as_deref().unwrap_or(user);
                let kind = kind.as_deref().unwrap_or(DEFAULT_NOTIFICATION_KIND);
                match self.publish(&ctx.actor, target, kind, &content).await {
                    Ok(notification) => id.map(|id| Frame::ack_with(id, notification)),
                    Err(e) => Some(error_frame(id, &e)),
                }
            }
            Frame::History { id, before, limit } => Some(match self.history(user, before, limit).await {
                Ok(items) => Frame::HistoryResult {
                    id,
                    items: items.into_iter().map(Event::from).collect(),
                },
                Err(e) => error_frame(Some(id), &e),
            }),
            Frame::MarkRead {
                id,
                notification_id,
            } => Some(match self.mark_read(notification_id, user).await {
                Ok(notification) => Frame::ack_with(id, notification),
                Err(e) => error_frame(Some(id), &e),
            }),
            _ => None,
        }
    }
}
