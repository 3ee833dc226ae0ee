//! Replication envelope.
//!
//! Every event a process publishes to the backplane is wrapped in an
//! [`Envelope`] tagged with that process's source identifier, so the
//! publisher can recognise and discard its own echo.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{ProtocolError, MAX_FRAME_SIZE};
use crate::model::Event;

/// Wire wrapper for one replicated event.
///
/// JSON shape: `{"source": "...", "payload": {...}, "sent_at": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque identifier of the publishing process.
    pub source: String,
    /// The wrapped message or notification.
    pub payload: Event,
    /// When the envelope was published.
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an event, stamping it with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, payload: impl Into<Event>) -> Self {
        Self {
            source: source.into(),
            payload: payload.into(),
            sent_at: Utc::now(),
        }
    }

    /// Whether this envelope was published by `source`.
    #[must_use]
    pub fn is_from(&self, source: &str) -> bool {
        self.source == source
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the result is too large.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let data = serde_json::to_vec(self)?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        Ok(Bytes::from(data))
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are too large or not a valid envelope.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Notification};

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new("node-a", Message::new("alice", "r1", "hello"));
        let value: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(value["source"], "node-a");
        assert_eq!(value["payload"]["room_id"], "r1");
        assert_eq!(value["payload"]["content"], "hello");
        assert!(value["sent_at"].is_string());
    }

    #[test]
    fn test_envelope_decode_notification_payload() {
        let note = Notification::new("bob", "mention", "ping");
        let env = Envelope::new("node-b", note.clone());

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert!(decoded.is_from("node-b"));
        assert!(!decoded.is_from("node-a"));
        assert_eq!(decoded.payload, Event::Notification(note));
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"source":"x","payload":{},"sent_at":"2024-01-01T00:00:00Z"}"#).is_err());
    }
}
