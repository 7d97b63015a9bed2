//! Errors - エントリのデコードエラー
//!
//! A payload that cannot be decoded is "poison": it is reported once and
//! dropped, never retried.

/// CodecError はエントリのエンコード/デコードの失敗
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The stored payload is not a valid entry of the expected shape.
    #[error("failed to parse {shape} entry: {reason}")]
    Malformed { shape: &'static str, reason: String },

    /// A stream message lacks the field carrying the serialized entry.
    #[error("stream message has no '{0}' field")]
    MissingField(&'static str),
}

impl CodecError {
    pub(crate) fn malformed(shape: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            shape,
            reason: err.to_string(),
        }
    }
}
