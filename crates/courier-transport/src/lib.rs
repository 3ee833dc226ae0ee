//! # courier-transport
//!
//! Transport abstraction layer for the Courier broadcast core.
//!
//! Two kinds of transport live here:
//!
//! - **Client connections** - a [`Connection`] is split into a
//!   [`FrameSource`] and a [`FrameSink`] so a session can read and write
//!   concurrently. Implementations: WebSocket (axum) and in-memory.
//! - **Backplane transports** - a [`BackplaneTransport`] replicates opaque
//!   payloads between server processes. Implementations: in-process bus,
//!   in-process durable queue, and a TCP peer mesh.
//!
//! ```rust,ignore
//! use courier_transport::{Connection, FrameSource};
//!
//! async fn drain(conn: Box<dyn Connection>) {
//!     let (mut source, _sink) = conn.split();
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod backplane;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backplane::{BackplaneStream, BackplaneTransport, MemoryBus, MemoryQueue, MeshConfig, TcpMesh};
pub use traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
