//! Call request/response types.
//!
//! Messages are self-describing field mappings: optional fields are omitted
//! from the wire rather than sent as `null`, so either side can add fields
//! without breaking the other.
//!
//! The server only checks that `request_id` and `method` are present, not
//! their type: a number or other non-string value is carried as its JSON
//! text, so `{"request_id": 42}` is answered with `"request_id": "42"`.

use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// `request_id` used when the request itself could not be read.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// Call parameters, interpreted structurally by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    /// Named arguments
    Named(Map<String, Value>),
    /// Positional arguments
    Positional(Vec<Value>),
    /// A single positional argument
    Scalar(Value),
}

impl Default for Params {
    fn default() -> Self {
        Params::Named(Map::new())
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Params::Named(map),
            Value::Array(items) => Params::Positional(items),
            other => Params::Scalar(other),
        }
    }
}

/// A call request as it travels on the wire.
///
/// `request_id` and `method` are optional at this level so the server can
/// report which required field is missing instead of rejecting the whole
/// message as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(
        default,
        deserialize_with = "presence_only",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "presence_only",
        skip_serializing_if = "Option::is_none"
    )]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Read a field of any JSON type as text. Null, `false`, zero and empty
/// collections count as absent.
fn presence_only<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| match value {
        Value::String(text) => Some(text),
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }))
}

impl CallRequest {
    /// Create a request stamped with the current local time.
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        params: Params,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Some(request_id.into()),
            method: Some(method.into()),
            params,
            timestamp: Some(now_timestamp()),
            client_id: Some(client_id.into()),
        }
    }

    /// The request id, treating an empty string as absent.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref().filter(|id| !id.is_empty())
    }

    /// The method name, treating an empty string as absent.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref().filter(|m| !m.is_empty())
    }
}

/// Outcome of a call.
///
/// The server only ever sends `Ok` or `Error`; the other variants are
/// synthesized by the client when an attempt budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Error,
    TimeoutError,
    ConnectionError,
    UnknownError,
    FatalError,
}

impl Status {
    /// True for statuses that only the client produces.
    pub fn is_client_synthesized(&self) -> bool {
        !matches!(self, Status::Ok | Status::Error)
    }
}

/// A call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub request_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timestamp: Option<String>,
    /// Attempts made, on client-synthesized failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<String>,
    /// Seconds spent on the attempt that produced this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    /// 1-based attempt that produced this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl CallResponse {
    fn bare(request_id: impl Into<String>, status: Status) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            result: None,
            error: None,
            server_timestamp: None,
            request_timestamp: None,
            attempts: None,
            client_timestamp: None,
            latency: None,
            attempt: None,
        }
    }

    /// Server success response.
    pub fn success(
        request_id: impl Into<String>,
        result: Value,
        request_timestamp: Option<String>,
    ) -> Self {
        Self {
            result: Some(result),
            server_timestamp: Some(now_timestamp()),
            request_timestamp,
            ..Self::bare(request_id, Status::Ok)
        }
    }

    /// Server error response.
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            server_timestamp: Some(now_timestamp()),
            ..Self::bare(request_id, Status::Error)
        }
    }

    /// Server response to a message that could not be decoded.
    pub fn invalid_message(details: impl std::fmt::Display) -> Self {
        Self::error(UNKNOWN_REQUEST_ID, format!("invalid message: {}", details))
    }

    /// Client-synthesized terminal failure.
    pub fn synthesized(
        request_id: impl Into<String>,
        status: Status,
        message: impl Into<String>,
        attempts: Option<u32>,
        client_timestamp: Option<String>,
    ) -> Self {
        Self {
            error: Some(message.into()),
            attempts,
            client_timestamp,
            ..Self::bare(request_id, status)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Current local time in RFC 3339 form.
pub fn now_timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
