//! FIFO entry: a value plus the reference it is stored under.

use serde::{Deserialize, Serialize};

use super::errors::CodecError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FifoEntry {
    /// Empty until the queue assigns one on enqueue.
    #[serde(default)]
    pub reference_uri: String,
    #[serde(default)]
    pub value: String,
}

impl FifoEntry {
    pub fn new(value: impl Into<String>) -> Self {
        Self::with_reference(value, "")
    }

    /// Enqueueing twice with the same explicit reference stores one entry.
    pub fn with_reference(value: impl Into<String>, reference_uri: impl Into<String>) -> Self {
        Self {
            reference_uri: reference_uri.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> String {
        // String フィールドのみなので serialize は失敗しない
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::malformed("queue", e))
    }
}
