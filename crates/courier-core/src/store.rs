//! Entity store interface.
//!
//! The store is the durable record of messages and notifications. Courier
//! only writes new rows and flips notification read flags; retention is the
//! store's concern. [`MemoryStore`] is a process-local implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{Message, Notification};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with that identity (or not owned by the caller).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A row with that identifier already exists.
    #[error("Duplicate id: {0}")]
    Duplicate(Uuid),

    /// The backing store failed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Chat message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message.
    async fn create_message(&self, message: &Message) -> Result<Uuid, StoreError>;

    /// Up to `limit` messages of a room created strictly before `before`
    /// (or the latest ones), in chronological order.
    async fn list_messages(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Notification persistence.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new notification.
    async fn create_notification(&self, notification: &Notification) -> Result<Uuid, StoreError>;

    /// Up to `limit` notifications of a user created strictly before
    /// `before` (or the latest ones), in chronological order.
    async fn list_notifications(
        &self,
        user_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Mark a notification owned by `user_id` as read.
    ///
    /// Returns the row and whether this call changed it.
    async fn mark_read(&self, id: Uuid, user_id: &str) -> Result<(Notification, bool), StoreError>;

    /// Number of unread notifications of a user.
    async fn unread_count(&self, user_id: &str) -> Result<usize, StoreError>;
}

/// Newest `limit` rows older than `before`, oldest first.
fn page<T: Clone>(
    rows: &[T],
    created_at: impl Fn(&T) -> DateTime<Utc>,
    before: Option<DateTime<Utc>>,
    limit: usize,
) -> Vec<T> {
    let mut page: Vec<T> = rows
        .iter()
        .rev()
        .filter(|row| before.map_or(true, |b| created_at(row) < b))
        .take(limit)
        .cloned()
        .collect();
    page.reverse();
    page
}

#[derive(Default)]
struct Inner {
    messages: HashMap<String, Vec<Message>>,
    notifications: HashMap<Uuid, Notification>,
    by_user: HashMap<String, Vec<Uuid>>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.messages.values().map(Vec::len).sum()
    }

    /// Total number of stored notifications.
    #[must_use]
    pub fn notification_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.notifications.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, message: &Message) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = inner.messages.entry(message.room_id.clone()).or_default();
        if room.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        room.push(message.clone());
        Ok(message.id)
    }

    async fn list_messages(
        &self,
        room_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .messages
            .get(room_id)
            .map(|rows| page(rows, |m| m.created_at, before, limit))
            .unwrap_or_default())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_notification(&self, notification: &Notification) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.notifications.contains_key(&notification.id) {
            return Err(StoreError::Duplicate(notification.id));
        }
        inner
            .notifications
            .insert(notification.id, notification.clone());
        inner
            .by_user
            .entry(notification.user_id.clone())
            .or_default()
            .push(notification.id);
        Ok(notification.id)
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let rows: Vec<Notification> = inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.notifications.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(page(&rows, |n| n.created_at, before, limit))
    }

    async fn mark_read(&self, id: Uuid, user_id: &str) -> Result<(Notification, bool), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let notification = inner
            .notifications
            .get_mut(&id)
            .filter(|n| n.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("notification {id}")))?;
        let changed = notification.mark_read(Utc::now());
        Ok((notification.clone(), changed))
    }

    async fn unread_count(&self, user_id: &str) -> Result<usize, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.by_user.get(user_id).map_or(0, |ids| {
            ids.iter()
                .filter(|id| inner.notifications.get(id).is_some_and(|n| !n.read))
                .count()
        }))
    }
}
