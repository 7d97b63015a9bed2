//! Stream entry: one message of a consumer-group stream.
//!
//! The whole entry travels as JSON under a single stream field,
//! [`ENTRY_FIELD`]. Retries are carried forward by re-appending a new
//! message, so `retries` and `last_error` are part of the payload while
//! `max_retries` is attached by the consumer at read time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::CodecError;

/// Stream field holding the serialized entry.
pub const ENTRY_FIELD: &str = "serializedEntryElement";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub id: Uuid,
    #[serde(default)]
    pub last_error: String,
    /// Accepted on read for older payloads; never written.
    #[serde(default, skip_serializing)]
    pub max_retries: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub value: String,
}

impl StreamEntry {
    pub fn new(id: Uuid, value: impl Into<String>) -> Self {
        Self {
            id,
            last_error: String::new(),
            // consumer が読み出し時に上書きする
            max_retries: 1,
            retries: 0,
            value: value.into(),
        }
    }

    /// Field/value pairs for `XADD`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let body = serde_json::to_string(self).unwrap_or_default();
        vec![(ENTRY_FIELD, body)]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, CodecError> {
        let raw = fields
            .get(ENTRY_FIELD)
            .ok_or(CodecError::MissingField(ENTRY_FIELD))?;
        serde_json::from_str(raw).map_err(|e| CodecError::malformed("stream", e))
    }

    pub fn with_increased_tries(mut self) -> Self {
        self.retries += 1;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_error(mut self, err: impl Into<String>) -> Self {
        self.last_error = err.into();
        self
    }

    /// `retries >= max_retries`. Handlers use this to stop asking for
    /// another delivery.
    pub fn is_last_try(&self) -> bool {
        self.retries >= self.max_retries
    }
}
