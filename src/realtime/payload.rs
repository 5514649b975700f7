//! Frame body decoding.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

/// `event` value of the wrapper substituted for bodies that are not JSON.
pub const RAW_EVENT: &str = "raw";

/// Decodes a `MESSAGE` body.
///
/// JSON bodies decode to their value. Anything else becomes
/// `{"event": "raw", "body": <text>}`, so every body produces a payload.
pub fn decode_body(body: &str) -> Value {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, body, "non-JSON payload received");
            raw_payload(body)
        }
    }
}

pub fn raw_payload(body: &str) -> Value {
    json!({ "event": RAW_EVENT, "body": body })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification the study-group service broadcasts after a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    #[serde(rename = "event")]
    pub kind: GroupChangeKind,
    pub id: i64,
}

impl GroupChange {
    /// Reads a typed change out of a decoded payload, if it has that shape.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }
}
