//! JSON wire codec.
//!
//! One message per connection turn: a compact JSON document terminated by
//! `\n`. Compact JSON never contains a raw newline, so the terminator is
//! unambiguous without a length prefix.

use serde::Serialize;
use serde::de::{self, DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Message terminator.
pub const DELIMITER: u8 = b'\n';

/// The payload was not well-formed structured text of the expected shape.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// The message could not be serialized.
#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Encode a message, including the trailing delimiter.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Decode one message. Surrounding whitespace, including the delimiter,
/// is ignored. Every message is a JSON object.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let value: Value = serde_json::from_slice(bytes.trim_ascii())?;
    if !value.is_object() {
        return Err(DecodeError(<serde_json::Error as de::Error>::custom(
            "message must be a JSON object",
        )));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{CallRequest, CallResponse, Params, Status};
    use serde_json::json;

    #[test]
    fn test_encode_is_single_line() {
        let req = CallRequest::new(
            "id-1",
            "echo",
            Params::from(json!({"message": "multi\nline"})),
            "c1",
        );
        let bytes = encode(&req).unwrap();

        assert_eq!(bytes.last(), Some(&DELIMITER));
        assert_eq!(bytes.iter().filter(|b| **b == DELIMITER).count(), 1);
    }

    #[test]
    fn test_decode_ignores_delimiter() {
        let resp: CallResponse =
            decode(b"{\"request_id\":\"x\",\"status\":\"ERROR\",\"error\":\"nope\"}\n").unwrap();
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.error.as_deref(), Some("nope"));
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_text() {
        assert!(decode::<CallRequest>(b"this is not json").is_err());
        assert!(decode::<CallRequest>(b"{\"request_id\": ").is_err());
        assert!(decode::<CallRequest>(b"").is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        // Valid JSON, but not a request object
        assert!(decode::<CallRequest>(b"[1, 2, 3]").is_err());
        assert!(decode::<CallRequest>(b"\"add\"").is_err());
        assert!(decode::<CallRequest>(b"null").is_err());
        // A response must carry a known status
        assert!(decode::<CallResponse>(b"{\"request_id\":\"x\",\"status\":\"MAYBE\"}").is_err());
    }
}
