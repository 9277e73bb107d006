//! Codec for encoding and decoding Tether events.
//!
//! Events travel as JSON text frames, one event per WebSocket text message.
//! Decoding enforces a maximum frame size so a single client cannot force
//! unbounded allocation.

use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Default maximum inbound frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding/decoding error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an outbound event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an inbound event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is oversized, malformed, or names an
/// unknown event.
pub fn decode(text: &str) -> Result<ClientEvent, ProtocolError> {
    decode_with_limit(text, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode an inbound event with an explicit frame size limit.
///
/// # Errors
///
/// Returns an error if the frame is oversized, malformed, or names an
/// unknown event.
pub fn decode_with_limit(text: &str, max_size: usize) -> Result<ClientEvent, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PresenceStatus;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let event = ServerEvent::user_status("alice", PresenceStatus::Online);
        let encoded = encode(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["event"], "user-status");

        let inbound = json!({
            "event": "user-online",
            "data": { "userId": "alice" }
        })
        .to_string();
        let decoded = decode(&inbound).unwrap();
        assert_eq!(
            decoded,
            ClientEvent::UserOnline {
                user_id: "alice".into()
            }
        );
    }

    #[test]
    fn test_decode_oversized_frame() {
        let padding = "x".repeat(64);
        let frame = json!({
            "event": "user-online",
            "data": { "userId": padding }
        })
        .to_string();

        match decode_with_limit(&frame, 32) {
            Err(ProtocolError::FrameTooLarge { .. }) => {}
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_event() {
        let frame = json!({
            "event": "self-destruct",
            "data": {}
        })
        .to_string();

        assert!(matches!(decode(&frame), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_decode_missing_field() {
        let frame = json!({
            "event": "send-message",
            "data": { "senderId": "alice" }
        })
        .to_string();

        assert!(decode(&frame).is_err());
    }
}
