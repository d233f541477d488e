//! Page ↔ worker message protocol.
//!
//! ```text
//! page   → worker   { "type": "NETWORK_STATUS",        "online": bool }
//! worker → pages    { "type": "NETWORK_STATUS_UPDATE", "online": bool }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Messages a page posts to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageMessage {
    /// The page saw its own connectivity change.
    #[serde(rename = "NETWORK_STATUS")]
    NetworkStatus { online: bool },

    /// Anything else; ignored by the worker.
    #[serde(other)]
    Unknown,
}

impl PageMessage {
    /// Decode a structured-clone payload. Malformed payloads become `Unknown`.
    pub fn from_value(data: JsonValue) -> Self {
        serde_json::from_value(data).unwrap_or(Self::Unknown)
    }

    /// Decode a raw JSON string. Malformed payloads become `Unknown`.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or(Self::Unknown)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Messages the worker broadcasts to pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Another page reported a connectivity change.
    #[serde(rename = "NETWORK_STATUS_UPDATE")]
    NetworkStatusUpdate { online: bool },
}

impl WorkerMessage {
    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
