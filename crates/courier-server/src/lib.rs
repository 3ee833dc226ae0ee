//! # courier-server
//!
//! HTTP and WebSocket front end for the Courier delivery core.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | liveness and hub statistics |
//! | `GET/POST /rooms/:room/messages` | room history, send |
//! | `GET/POST /notifications` | own notifications, publish |
//! | `GET /notifications/unread` | unread count |
//! | `POST /notifications/:id/read` | mark read |
//! | `GET /ws/rooms/:room` | live room session |
//! | `GET /ws/notifications` | live notification feed |

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{router, run_server, AppState};
