//! In-process publish/subscribe bus.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{BackplaneStream, BackplaneTransport};
use crate::traits::TransportError;

/// Default per-subject buffer.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A publish/subscribe bus shared by cloning.
///
/// Every subscriber of a subject sees every payload published after it
/// subscribed. A subscriber that falls more than `capacity` payloads behind
/// skips the oldest ones.
#[derive(Clone)]
pub struct MemoryBus {
    subjects: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus with the default buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific per-subject buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subjects: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Tear the bus down; every open stream ends.
    pub fn shutdown(&self) {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        subjects.clear();
        debug!("Memory bus shut down");
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Bytes> {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackplaneTransport for MemoryBus {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        // No subscribers is not an error for a bus.
        let _ = self.sender(subject).send(payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BackplaneStream>, TransportError> {
        let rx = self.sender(subject).subscribe();
        Ok(Box::new(BusStream {
            subject: subject.to_string(),
            rx,
        }))
    }
}

struct BusStream {
    subject: String,
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl BackplaneStream for BusStream {
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subject = %self.subject, skipped, "Bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
