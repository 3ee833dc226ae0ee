//! # courier-core
//!
//! Realtime broadcast delivery for Courier.
//!
//! This crate provides the delivery pipeline:
//!
//! - **Hub** - in-process fan-out of events to live subscriber channels
//! - **Backplane** - cross-process replication with self-echo filtering
//! - **Session** - reader/writer tasks backing one client connection
//! - **Services** - chat and notification pipelines (validate, authorize,
//!   sanitize, persist, fan out)
//! - **Store** / **Recall** - persistence and last-message cache interfaces
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Service   │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ├──────────────────┐
//!        │                   ▼                  ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│     Hub     │◀────│  Backplane  │◀──── other processes
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod auth;
pub mod backplane;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod recall;
pub mod sanitize;
pub mod service;
pub mod session;
pub mod store;

pub use auth::{Actor, Role};
pub use backplane::{Backplane, BackplaneConfig, BackplaneError};
pub use error::ServiceError;
pub use hub::{BroadcastOutcome, Hub, HubStats, Subscription, Topic};
pub use recall::{MemoryRecallCache, RecallCache, RecallError};
pub use sanitize::Sanitizer;
pub use service::{ChatConfig, ChatService, NotificationConfig, NotificationService, SendRequest};
pub use session::{Session, SessionConfig, SessionContext, SessionHandler, SessionState};
pub use store::{MemoryStore, MessageStore, NotificationStore, StoreError};
