//! Backplane transports.
//!
//! A backplane transport moves opaque byte payloads between server
//! processes on named subjects. Three variants are provided:
//!
//! - [`MemoryBus`] - in-process publish/subscribe; slow subscribers lag
//! - [`MemoryQueue`] - in-process durable queue; retains payloads until a
//!   consumer binds
//! - [`TcpMesh`] - direct TCP links to peer processes
//!
//! A process may run any number of them side by side; they all carry the
//! same envelope bytes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::traits::TransportError;

pub mod bus;
pub mod mesh;
pub mod queue;

pub use bus::MemoryBus;
pub use mesh::{MeshConfig, TcpMesh};
pub use queue::MemoryQueue;

/// A cross-process event transport.
#[async_trait]
pub trait BackplaneTransport: Send + Sync {
    /// Transport name used in logs and metrics (e.g. "bus", "mesh").
    fn name(&self) -> &'static str;

    /// Publish a payload on a subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn BackplaneStream>, TransportError>;
}

/// A stream of payloads received on one subject.
#[async_trait]
pub trait BackplaneStream: Send {
    /// Receive the next payload.
    ///
    /// Returns `None` once the transport is permanently gone.
    async fn next(&mut self) -> Result<Option<Bytes>, TransportError>;
}
