//! Recall cache: the most recent payload per key, with a time-to-live.
//!
//! Used to prime a newly joined subscriber with the last message of a room.
//! The cache is an optimisation only; callers treat every failure as a miss.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Recall cache errors.
#[derive(Debug, Error)]
pub enum RecallError {
    /// The backing store could not be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// A short-lived key-value cache.
#[async_trait]
pub trait RecallCache: Send + Sync {
    /// Fetch the live value for a key.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RecallError>;

    /// Store a value, replacing any previous one, for `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RecallError>;
}

/// In-process recall cache.
#[derive(Default)]
pub struct MemoryRecallCache {
    entries: DashMap<String, (Bytes, Instant)>,
}

impl MemoryRecallCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, (_, expires)| {
            let live = *expires > now;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    /// Purge expired entries every `interval` until `cancel` fires.
    pub fn spawn_purge(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            debug!(removed, remaining = self.len(), "Purged recall entries");
                        }
                    }
                }
            }
        })
    }

    /// Number of stored entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RecallCache for MemoryRecallCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RecallError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), RecallError> {
        let expires = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| RecallError::Unavailable(format!("ttl out of range: {ttl:?}")))?;
        self.entries.insert(key.to_string(), (value, expires));
        Ok(())
    }
}
