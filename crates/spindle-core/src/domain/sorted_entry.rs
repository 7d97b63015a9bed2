//! Sorted (priority) queue entry.
//!
//! # 永続化と session フィールド
//! - 永続化: value, priority, referenceUri, expiration, failures, retries
//! - session のみ: max_retries, queue, current_failure（consumer が読み出し時に付与）
//!
//! `retries` is written by the queue at enqueue time and read back into
//! `current_retries`; the entry itself never decides its own retry count.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::CodecError;

/// `Duration` as integer nanoseconds on the wire.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        // 負の値（Go の Duration は i64）は 0 として扱う
        let nanos = i64::deserialize(d)?;
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortedEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Lower scores are consumed first.
    pub priority: f64,
    pub reference_uri: String,
    /// TTL of the stored body; zero keeps it forever.
    #[serde(default, with = "duration_nanos")]
    pub expiration: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    #[serde(default)]
    pub current_retries: u32,

    #[serde(skip)]
    max_retries: u32,
    #[serde(skip)]
    queue: String,
    #[serde(skip)]
    current_failure: Option<String>,
}

/// Shape of the stored body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSortedEntry {
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    value: String,
    priority: f64,
    reference_uri: String,
    #[serde(default, with = "duration_nanos")]
    expiration: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    failures: Vec<String>,
}

impl SortedEntry {
    pub fn new(
        value: impl Into<String>,
        priority: f64,
        reference_uri: impl Into<String>,
        expiration: Duration,
    ) -> Self {
        Self {
            value: value.into(),
            priority,
            reference_uri: reference_uri.into(),
            expiration,
            failures: Vec::new(),
            current_retries: 0,
            max_retries: 0,
            queue: String::new(),
            current_failure: None,
        }
    }

    /// Serialize the persisted form with `retries` as the stored retry count.
    pub fn encode(&self, retries: u32) -> String {
        let persisted = PersistedSortedEntry {
            retries,
            value: self.value.clone(),
            priority: self.priority,
            reference_uri: self.reference_uri.clone(),
            expiration: self.expiration,
            failures: self.failures.clone(),
        };
        // f64 が NaN/inf の場合のみ失敗しうる（serde_json は null を書く）
        serde_json::to_string(&persisted).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let p: PersistedSortedEntry =
            serde_json::from_str(raw).map_err(|e| CodecError::malformed("sorted queue", e))?;
        let mut entry = Self::new(p.value, p.priority, p.reference_uri, p.expiration);
        entry.failures = p.failures;
        entry.current_retries = p.retries;
        Ok(entry)
    }

    /// Attach the consumer's session settings.
    pub(crate) fn attach_session(&mut self, max_retries: u32, queue: &str) {
        self.max_retries = max_retries;
        self.queue = queue.to_string();
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queue the entry was consumed from (empty before consumption).
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The current attempt is the last one allowed (`current >= max`).
    pub fn is_last_retry(&self) -> bool {
        self.current_retries >= self.max_retries
    }

    /// The entry ran past its budget (`current > max`) and must not reach a
    /// handler.
    pub fn has_exhausted_retries(&self) -> bool {
        self.current_retries > self.max_retries
    }

    /// Flag this entry for another attempt.
    pub fn retry(&mut self, reason: impl std::fmt::Display) {
        self.set_failure(reason.to_string());
    }

    pub fn is_flagged(&self) -> bool {
        self.current_failure.is_some()
    }

    pub fn current_failure(&self) -> Option<&str> {
        self.current_failure.as_deref()
    }

    pub(crate) fn set_failure(&mut self, failure: String) {
        self.failures.push(failure.clone());
        self.current_failure = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry() -> SortedEntry {
        SortedEntry::new("v", 0.25, "gid://q/1", Duration::from_secs(3600))
    }

    #[test]
    fn decode_preserves_persisted_fields() {
        let mut e = entry();
        e.failures = vec!["boom".to_string()];
        let decoded = SortedEntry::decode(&e.encode(2)).unwrap();

        assert_eq!(decoded.value, "v");
        assert_eq!(decoded.priority, 0.25);
        assert_eq!(decoded.reference_uri, "gid://q/1");
        assert_eq!(decoded.expiration, Duration::from_secs(3600));
        assert_eq!(decoded.failures, vec!["boom".to_string()]);
        assert_eq!(decoded.current_retries, 2);
    }

    #[test]
    fn persisted_form_uses_retries_and_nanosecond_expiration() {
        let json: serde_json::Value = serde_json::from_str(&entry().encode(1)).unwrap();
        assert_eq!(json["retries"], 1);
        assert_eq!(json["expiration"], 3_600_000_000_000u64);
        assert_eq!(json["referenceUri"], "gid://q/1");
        assert!(json.get("failures").is_none());
        assert!(json.get("maxRetries").is_none());
    }

    #[test]
    fn missing_failures_decode_as_empty() {
        let raw = r#"{"retries":0,"value":"x","priority":1,"referenceUri":"gid://q/2","expiration":0}"#;
        let decoded = SortedEntry::decode(raw).unwrap();
        assert!(decoded.failures.is_empty());
        assert_eq!(decoded.expiration, Duration::ZERO);
    }

    #[test]
    fn session_fields_are_not_persisted() {
        let mut e = entry();
        e.attach_session(5, "queue-a");
        e.retry("nope");
        let decoded = SortedEntry::decode(&e.encode(0)).unwrap();
        assert_eq!(decoded.max_retries(), 0);
        assert_eq!(decoded.queue(), "");
        assert!(!decoded.is_flagged());
        assert_eq!(decoded.failures, vec!["nope".to_string()]);
    }

    #[test]
    fn malformed_body_is_poison() {
        assert!(matches!(
            SortedEntry::decode("{\"priority\":\"high\"}"),
            Err(CodecError::Malformed { .. })
        ));
    }

    // last retry は >=、exhausted は > : 1 回分の非対称は意図的に残している
    #[rstest]
    #[case(2, 3, false, false)]
    #[case(3, 3, true, false)]
    #[case(4, 3, true, true)]
    fn retry_boundaries(
        #[case] current: u32,
        #[case] max: u32,
        #[case] last: bool,
        #[case] exhausted: bool,
    ) {
        let mut e = entry();
        e.current_retries = current;
        e.attach_session(max, "q");
        assert_eq!(e.is_last_retry(), last);
        assert_eq!(e.has_exhausted_retries(), exhausted);
    }

    #[test]
    fn retry_flags_and_records_failure() {
        let mut e = entry();
        assert!(!e.is_flagged());
        e.retry("first");
        e.retry("second");
        assert_eq!(e.current_failure(), Some("second"));
        assert_eq!(e.failures, vec!["first".to_string(), "second".to_string()]);
    }
}
