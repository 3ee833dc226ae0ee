//! # courier-protocol
//!
//! Wire definitions for the Courier realtime broadcast core.
//!
//! This crate defines the entities Courier delivers, the frames a client
//! session exchanges with the server, and the envelope used to replicate
//! events between server processes.
//!
//! ## Frame Types
//!
//! - `Send` / `History` / `MarkRead` - Client commands
//! - `Message` / `Notification` - Fan-out deliveries
//! - `Ack` / `Error` / `HistoryResult` - Replies
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::send_with_ack(1, "Hello, world!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod model;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use envelope::Envelope;
pub use frames::{Frame, FrameType, PROTOCOL_VERSION};
pub use model::{Event, Message, Notification};
