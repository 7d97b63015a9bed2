//! Failure records handed to failure handlers.
//!
//! # 設計原則
//! - payload の種類は enum で表す（match で網羅チェックされる）
//! - engine は失敗した entry を片付けない。cleanup は failure handler の責務
//! - ログ出力用に従来の `referenceUri` / `value` / `entry` キーの map も作れる

use serde_json::{Map, Value};

use super::sorted_entry::SortedEntry;
use crate::error::EngineError;

/// What the failing operation was holding when it failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePayload {
    /// Nothing entry-specific (e.g. the queue itself could not be read).
    Empty,
    /// The reference could not be resolved to a body.
    Reference { reference_uri: String },
    /// The body (or a stored score) was present but unusable.
    Value { reference_uri: String, value: String },
    /// A decoded entry: exhausted, failed to retry, or failed to mark.
    Entry(SortedEntry),
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub error: EngineError,
    pub payload: FailurePayload,
}

impl FailureRecord {
    pub fn new(error: impl Into<EngineError>, payload: FailurePayload) -> Self {
        Self {
            error: error.into(),
            payload,
        }
    }

    pub fn empty(error: impl Into<EngineError>) -> Self {
        Self::new(error, FailurePayload::Empty)
    }

    pub fn reference(error: impl Into<EngineError>, reference_uri: impl Into<String>) -> Self {
        Self::new(
            error,
            FailurePayload::Reference {
                reference_uri: reference_uri.into(),
            },
        )
    }

    pub fn value(
        error: impl Into<EngineError>,
        reference_uri: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::new(
            error,
            FailurePayload::Value {
                reference_uri: reference_uri.into(),
                value: value.into(),
            },
        )
    }

    pub fn entry(error: impl Into<EngineError>, entry: SortedEntry) -> Self {
        Self::new(error, FailurePayload::Entry(entry))
    }

    /// Reference the failure is about, if any.
    pub fn reference_uri(&self) -> Option<&str> {
        match &self.payload {
            FailurePayload::Empty => None,
            FailurePayload::Reference { reference_uri }
            | FailurePayload::Value { reference_uri, .. } => Some(reference_uri),
            FailurePayload::Entry(entry) => Some(&entry.reference_uri),
        }
    }

    /// Conventional string-keyed rendering of the payload.
    pub fn payload_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match &self.payload {
            FailurePayload::Empty => {}
            FailurePayload::Reference { reference_uri } => {
                map.insert("referenceUri".into(), Value::from(reference_uri.as_str()));
            }
            FailurePayload::Value {
                reference_uri,
                value,
            } => {
                map.insert("referenceUri".into(), Value::from(reference_uri.as_str()));
                map.insert("value".into(), Value::from(value.as_str()));
            }
            FailurePayload::Entry(entry) => {
                map.insert(
                    "entry".into(),
                    serde_json::to_value(entry).unwrap_or(Value::Null),
                );
            }
        }
        map
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.error, Value::Object(self.payload_map()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn payload_map_uses_conventional_keys() {
        let empty = FailureRecord::empty(EngineError::Connect("refused".into()));
        assert!(empty.payload_map().is_empty());
        assert_eq!(empty.reference_uri(), None);

        let reference = FailureRecord::reference(
            EngineError::MissingEntry("gid://q/1".into()),
            "gid://q/1",
        );
        assert_eq!(reference.payload_map()["referenceUri"], "gid://q/1");

        let value = FailureRecord::value(
            EngineError::InvalidReference("x".into()),
            "gid://q/2",
            "garbage",
        );
        let map = value.payload_map();
        assert_eq!(map["referenceUri"], "gid://q/2");
        assert_eq!(map["value"], "garbage");
    }

    #[test]
    fn entry_payload_renders_public_fields() {
        let entry = SortedEntry::new("v", 1.5, "gid://q/3", Duration::ZERO);
        let record = FailureRecord::entry(
            EngineError::RetriesExhausted {
                reference_uri: "gid://q/3".into(),
                retries: 4,
            },
            entry,
        );
        assert_eq!(record.reference_uri(), Some("gid://q/3"));
        let map = record.payload_map();
        assert_eq!(map["entry"]["referenceUri"], "gid://q/3");
        assert_eq!(map["entry"]["priority"], 1.5);
    }
}
