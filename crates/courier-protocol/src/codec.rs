//! Codec for encoding and decoding Courier frames.
//!
//! Binary frames are MessagePack with a 4-byte big-endian length prefix.
//! Text frames are plain JSON, one frame per WebSocket text message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// How frames are carried on a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text messages.
    #[default]
    Text,
    /// Length-prefixed MessagePack binary messages.
    Binary,
}

impl std::str::FromStr for WireFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "json" => Ok(WireFormat::Text),
            "binary" | "msgpack" => Ok(WireFormat::Binary),
            other => Err(ProtocolError::Invalid(format!("unknown wire format: {other}"))),
        }
    }
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Notification};

    #[test]
    fn test_binary_roundtrip_with_entities() {
        let frames = vec![
            Frame::send_with_ack(1, "hello"),
            Frame::deliver(&Message::new("alice", "r1", "hello").into()),
            Frame::ack_with(7, Notification::new("bob", "system", "welcome")),
            Frame::error(1, 1001, "Invalid frame"),
            Frame::connected("conn-123", "room:r1", 30000),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::send("test");
        let encoded = encode(&frame).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::send("x".repeat(MAX_FRAME_SIZE + 1));

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
        assert!(matches!(
            encode_text(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::send("one");
        let frame2 = Frame::history(2, None, Some(10));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&frame1).unwrap());
        buf.extend_from_slice(&encode(&frame2).unwrap());

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_text_decode_rejects_garbage() {
        assert!(matches!(
            decode_text("{\"type\":\"nope\"}"),
            Err(ProtocolError::Json(_))
        ));
        assert_eq!(decode_text(r#"{"type":"ping"}"#).unwrap(), Frame::ping());
    }

    #[test]
    fn test_wire_format_parse() {
        assert_eq!("json".parse::<WireFormat>().unwrap(), WireFormat::Text);
        assert_eq!("binary".parse::<WireFormat>().unwrap(), WireFormat::Binary);
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
