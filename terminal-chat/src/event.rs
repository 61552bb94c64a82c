use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol events exchanged once a frame has been decrypted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message { from: String, body: String },
    Users { count: u64 },
}

impl Event {
    pub fn message(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Message {
            from: from.into(),
            body: body.into(),
        }
    }

    pub fn users(count: usize) -> Self {
        Self::Users {
            count: count as u64,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// Not a JSON object, missing or unknown `type`, or a field missing for
    /// the resolved variant.
    #[error("malformed event: {0}")]
    DecodeFailure(#[source] serde_json::Error),
}

pub fn encode(event: &Event) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(CodecError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Event, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::DecodeFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wire_shape_carries_type_discriminant() {
        let encoded = encode(&Event::message("alice", "hi")).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");

        assert_eq!(
            value,
            serde_json::json!({"type": "message", "from": "alice", "body": "hi"})
        );
    }

    #[test]
    fn users_event_decodes() {
        let event = decode(br#"{"type":"users","count":2}"#).expect("decode");
        assert_eq!(event, Event::Users { count: 2 });
    }

    #[test]
    fn missing_discriminant_is_rejected() {
        let result = decode(br#"{"from":"alice","body":"hi"}"#);
        assert!(matches!(result, Err(CodecError::DecodeFailure(_))));
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        let result = decode(br#"{"type":"username","username":"alice"}"#);
        assert!(matches!(result, Err(CodecError::DecodeFailure(_))));
    }

    #[test]
    fn missing_variant_field_is_rejected() {
        let result = decode(br#"{"type":"message","from":"alice"}"#);
        assert!(matches!(result, Err(CodecError::DecodeFailure(_))));

        let result = decode(br#"{"type":"users"}"#);
        assert!(matches!(result, Err(CodecError::DecodeFailure(_))));
    }

    #[test]
    fn negative_count_and_non_json_are_rejected() {
        assert!(decode(br#"{"type":"users","count":-1}"#).is_err());
        assert!(decode(b"hello").is_err());
        assert!(decode(b"[]").is_err());
    }
}
