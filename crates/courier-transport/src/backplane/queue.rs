//! In-process durable queue.
//!
//! Unlike the bus, payloads published while no consumer is bound are kept in
//! a bounded backlog and handed to the first consumer that binds, and bound
//! consumers never lag: each has its own unbounded queue.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{BackplaneStream, BackplaneTransport};
use crate::traits::TransportError;

/// Default number of payloads retained per subject without consumers.
const DEFAULT_BACKLOG: usize = 10_000;

#[derive(Default)]
struct SubjectQueue {
    consumers: Vec<mpsc::UnboundedSender<Bytes>>,
    backlog: VecDeque<Bytes>,
}

/// A durable queue shared by cloning.
#[derive(Clone)]
pub struct MemoryQueue {
    subjects: Arc<Mutex<HashMap<String, SubjectQueue>>>,
    max_backlog: usize,
}

impl MemoryQueue {
    /// Create a queue with the default backlog bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    /// Create a queue retaining at most `max_backlog` payloads per subject.
    #[must_use]
    pub fn with_backlog(max_backlog: usize) -> Self {
        Self {
            subjects: Arc::new(Mutex::new(HashMap::new())),
            max_backlog,
        }
    }

    /// Number of payloads waiting for a consumer on `subject`.
    #[must_use]
    pub fn backlog_len(&self, subject: &str) -> usize {
        let subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        subjects.get(subject).map_or(0, |q| q.backlog.len())
    }

    /// Drop all consumers; every open stream ends once drained.
    pub fn shutdown(&self) {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        for queue in subjects.values_mut() {
            queue.consumers.clear();
        }
        debug!("Memory queue shut down");
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackplaneTransport for MemoryQueue {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        let queue = subjects.entry(subject.to_string()).or_default();

        queue.consumers.retain(|tx| !tx.is_closed());
        if queue.consumers.is_empty() {
            if queue.backlog.len() >= self.max_backlog {
                return Err(TransportError::QueueFull(subject.to_string()));
            }
            queue.backlog.push_back(payload);
            return Ok(());
        }

        for tx in &queue.consumers {
            let _ = tx.send(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BackplaneStream>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subjects = self.subjects.lock().unwrap_or_else(|e| e.into_inner());
        let queue = subjects.entry(subject.to_string()).or_default();

        for payload in queue.backlog.drain(..) {
            let _ = tx.send(payload);
        }
        queue.consumers.push(tx);

        Ok(Box::new(QueueStream { rx }))
    }
}

struct QueueStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl BackplaneStream for QueueStream {
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
