//! Crash recovery of entries left checked out by a dead consumer.

use tracing::{info, warn};

use super::{FailureHandler, SortedQueue, processing_priority_key, processing_reference_key};
use crate::domain::FailureRecord;
use crate::domain::errors::CodecError;
use crate::error::EngineError;

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// References put back into the sorted set.
    pub recovered: Vec<String>,
    pub failures: Vec<FailureRecord>,
}

impl SortedQueue {
    /// Re-insert every processing-set member at its recorded priority, then
    /// drop its markers. Runs under the queue's lease lock. A failing member
    /// is reported and the scan continues.
    pub async fn recover(
        &self,
        consumer_id: &str,
        failure_handler: &dyn FailureHandler,
    ) -> RecoveryOutcome {
        let lease = self.lock.acquire(&self.name).await;
        let outcome = self.recover_locked(consumer_id).await;
        let _ = lease.release().await;

        if !outcome.failures.is_empty() {
            failure_handler
                .handle(outcome.failures.clone(), consumer_id)
                .await;
        }
        outcome
    }

    async fn recover_locked(&self, consumer_id: &str) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::default();
        let set_key = processing_reference_key(&self.name);
        let hash_key = processing_priority_key(&self.name);

        let members = match self.store.smembers(&set_key).await {
            Ok(members) => members,
            Err(e) => {
                warn!(queue = %self.name, consumer_id, error = %e, "failed to list processing entries");
                Vec::new()
            }
        };

        let mut revived = Vec::with_capacity(members.len());
        for reference in members {
            let raw = match self.store.hget(&hash_key, &reference).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    let err = EngineError::MissingEntry(format!("{hash_key}[{reference}]"));
                    outcome.failures.push(FailureRecord::reference(err, reference));
                    continue;
                }
                Err(e) => {
                    outcome.failures.push(FailureRecord::reference(e, reference));
                    continue;
                }
            };
            let priority: f64 = match raw.parse() {
                Ok(priority) => priority,
                Err(e) => {
                    let err = CodecError::malformed("priority", e);
                    outcome.failures.push(FailureRecord::value(err, reference, raw));
                    continue;
                }
            };
            if let Err(e) = self.store.zadd_nx(&self.name, &reference, priority).await {
                outcome.failures.push(FailureRecord::reference(e, reference));
                continue;
            }
            info!(queue = %self.name, consumer_id, reference_uri = %reference, priority, "recovered entry");
            revived.push(reference);
        }

        for reference in revived {
            if let Err(e) = self.store.hdel(&hash_key, &reference).await {
                outcome.failures.push(FailureRecord::reference(e, reference));
                continue;
            }
            if let Err(e) = self.store.srem(&set_key, &reference).await {
                outcome.failures.push(FailureRecord::reference(e, reference));
                continue;
            }
            outcome.recovered.push(reference);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::FailurePayload;
    use crate::impls::InMemoryStore;
    use crate::ports::Store;

    #[derive(Default)]
    struct Collect(Mutex<Vec<FailureRecord>>);

    #[async_trait]
    impl FailureHandler for Collect {
        async fn handle(&self, failures: Vec<FailureRecord>, _consumer_id: &str) {
            self.0.lock().unwrap().extend(failures);
        }
    }

    async fn orphan(store: &InMemoryStore, reference: &str, priority: &str) {
        store
            .sadd(&processing_reference_key("q"), &[reference.to_string()])
            .await
            .unwrap();
        store
            .hset_nx(&processing_priority_key("q"), reference, priority)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orphan_returns_at_original_priority() {
        let store = Arc::new(InMemoryStore::new());
        let q = SortedQueue::new(store.clone(), "q");
        orphan(&store, "gid://q/1", "0.7").await;

        let failures = Collect::default();
        let outcome = q.recover("c1", &failures).await;

        assert_eq!(outcome.recovered, vec!["gid://q/1"]);
        assert_eq!(store.zscore("q", "gid://q/1"), Some(0.7));
        assert!(store.smembers(&processing_reference_key("q")).await.unwrap().is_empty());
        assert!(
            store
                .hget(&processing_priority_key("q"), "gid://q/1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(failures.0.lock().unwrap().is_empty());
        assert!(!store.exists("LOCK::q").await.unwrap());
    }

    #[tokio::test]
    async fn bad_member_is_reported_and_scan_continues() {
        let store = Arc::new(InMemoryStore::new());
        let q = SortedQueue::new(store.clone(), "q");
        orphan(&store, "gid://q/bad", "not-a-number").await;
        orphan(&store, "gid://q/good", "1.5").await;
        store
            .sadd(&processing_reference_key("q"), &["gid://q/nohash".to_string()])
            .await
            .unwrap();

        let failures = Collect::default();
        let outcome = q.recover("c1", &failures).await;

        assert_eq!(outcome.recovered, vec!["gid://q/good"]);
        assert_eq!(store.zscore("q", "gid://q/good"), Some(1.5));

        let reported = failures.0.lock().unwrap();
        assert_eq!(reported.len(), 2);
        assert!(reported.iter().any(|f| matches!(
            &f.payload,
            FailurePayload::Value { value, .. } if value == "not-a-number"
        )));
        assert!(
            reported
                .iter()
                .any(|f| f.reference_uri() == Some("gid://q/nohash"))
        );
    }

    #[tokio::test]
    async fn nothing_to_recover_reports_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let q = SortedQueue::new(store, "q");
        let failures = Collect::default();
        let outcome = q.recover("c1", &failures).await;
        assert!(outcome.recovered.is_empty());
        assert!(outcome.failures.is_empty());
    }
}
