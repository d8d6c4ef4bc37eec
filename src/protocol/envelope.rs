//! Work envelope: the routing metadata embedded in a frame's `message` header
//!
//! The control plane describes each unit of work as a JSON object carried in a
//! single frame header. Decoding is fail-closed: an envelope that does not
//! match the schema (missing payload, unknown request type) is rejected with a
//! named error before any business logic runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Frame header carrying the JSON work envelope
pub const ENVELOPE_HEADER: &str = "message";

/// Frame header carrying the broker message id
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Typed tags for the work requests the control plane can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Connectivity probe; echoes its payload back
    Ping,
    /// Bulk subscription import, partitioned across the task queue
    ImportSubscriptions,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::Ping => f.write_str("PING"),
            RequestType::ImportSubscriptions => f.write_str("IMPORT_SUBSCRIPTIONS"),
        }
    }
}

/// Routing metadata for one inbound work request
///
/// `request_type` and `payload` are mandatory; the response fields default to
/// empty strings when the control plane omits them.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkEnvelope {
    #[serde(rename = "requestType")]
    pub request_type: RequestType,

    pub payload: Value,

    #[serde(rename = "responseUsername", default)]
    pub response_username: String,

    #[serde(rename = "responseDestination", default)]
    pub response_destination: String,
}

impl WorkEnvelope {
    /// Decode the `message` header contents, rejecting anything off-schema
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Malformed)
    }
}

/// Outbound response body: `{responseType, message}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "responseType")]
    pub response_type: String,

    pub message: Value,
}

impl ResponseBody {
    pub fn new(response_type: impl Into<String>, message: Value) -> Self {
        Self {
            response_type: response_type.into(),
            message,
        }
    }

    pub fn encode(&self) -> String {
        // Serialization of a string + Value pair cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Envelope decode errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed work envelope: {0}")]
    Malformed(#[source] serde_json::Error),
}
