//! SortedQueue - sorted set ベースの priority queue
//!
//! # ストア上の構造
//! - `<queue>`: sorted set（member = 参照 URI, score = priority、小さいほど先）
//! - `<参照 URI>`: entry body（JSON、entry の expiration を TTL に使う）
//! - `sortedQueue::<queue>::processing::reference`: 処理中 URI の set
//! - `sortedQueue::<queue>::processing::priory`: 処理中 URI → 元の priority の hash
//!
//! 処理中マーカー（set + hash）は常にペアで書き、ペアで消す。
//! crash recovery はこのペアから未完了 entry を sorted set に戻す。
//!
//! # 学習ポイント
//! - handler の panic は `tokio::spawn` + `JoinError::is_panic()` で捕まえる
//! - 1 batch の結果は [`BatchOutcome`] として値で返す

mod consumer;
pub mod options;
mod recovery;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::lock::LeaseLock;
use crate::domain::{FailureRecord, SortedEntry};
use crate::error::EngineError;
use crate::ports::Store;

pub use self::consumer::BatchOutcome;
pub use self::options::SortedQueueOptions;
pub use self::recovery::RecoveryOutcome;

/// Processing-set key of `queue`.
pub fn processing_reference_key(queue: &str) -> String {
    format!("sortedQueue::{queue}::processing::reference")
}

/// Processing-priority hash key of `queue`. The spelling matches existing
/// deployments.
pub fn processing_priority_key(queue: &str) -> String {
    format!("sortedQueue::{queue}::processing::priory")
}

/// Priority of the next attempt: 10% further from the front. Negative
/// scores move toward zero's side as well, so a retry never jumps ahead.
pub fn decayed_priority(priority: f64) -> f64 {
    priority + priority.abs() * 0.1
}

/// Processes one batch and hands every entry back, flagging the ones that
/// need another attempt with [`SortedEntry::retry`].
#[async_trait]
pub trait SortedHandler: Send + Sync {
    async fn handle(&self, entries: Vec<SortedEntry>, consumer_id: &str) -> Vec<SortedEntry>;
}

/// Receives non-empty batches of failures. Cleaning up the payload (for an
/// exhausted entry, [`SortedQueue::clean_up`]) is the handler's job.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle(&self, failures: Vec<FailureRecord>, consumer_id: &str);
}

#[derive(Clone)]
pub struct SortedQueue {
    store: Arc<dyn Store>,
    lock: LeaseLock,
    name: String,
}

impl SortedQueue {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            lock: LeaseLock::new(Arc::clone(&store)),
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist a fresh entry (retries = 0) and add it at its priority.
    pub async fn enqueue(&self, entry: &SortedEntry) -> Result<(), EngineError> {
        self.re_enqueue(entry, 0).await
    }

    /// Overwrite the stored body with `retries`, then add-if-absent.
    pub async fn re_enqueue(&self, entry: &SortedEntry, retries: u32) -> Result<(), EngineError> {
        if !entry.priority.is_finite() {
            return Err(EngineError::InvalidPriority {
                reference_uri: entry.reference_uri.clone(),
                priority: entry.priority,
            });
        }
        let ttl = (!entry.expiration.is_zero()).then_some(entry.expiration);
        self.store
            .set(&entry.reference_uri, &entry.encode(retries), ttl)
            .await?;
        self.store
            .zadd_nx(&self.name, &entry.reference_uri, entry.priority)
            .await?;
        Ok(())
    }

    /// Record `entries` as checked out.
    pub async fn mark_processing(&self, entries: &[SortedEntry]) -> Result<(), EngineError> {
        let refs: Vec<String> = entries.iter().map(|e| e.reference_uri.clone()).collect();
        self.store
            .sadd(&processing_reference_key(&self.name), &refs)
            .await?;
        let priority_key = processing_priority_key(&self.name);
        for entry in entries {
            self.store
                .hset_nx(&priority_key, &entry.reference_uri, &entry.priority.to_string())
                .await?;
        }
        Ok(())
    }

    /// Best-effort removal of the markers of a batch whose marking failed
    /// part way. Errors are only logged.
    pub(crate) async fn unmark(&self, entries: &[SortedEntry]) {
        for entry in entries {
            if let Err(e) = self.ack(entry).await {
                warn!(
                    queue = %self.name,
                    reference_uri = %entry.reference_uri,
                    error = %e,
                    "failed to roll back processing markers"
                );
            }
        }
    }

    /// Drop the processing markers of `entry`.
    pub async fn ack(&self, entry: &SortedEntry) -> Result<(), EngineError> {
        self.store
            .srem(&processing_reference_key(&self.name), &entry.reference_uri)
            .await?;
        self.store
            .hdel(&processing_priority_key(&self.name), &entry.reference_uri)
            .await?;
        Ok(())
    }

    /// Drop the processing markers and the stored body.
    pub async fn clean_up(&self, entry: &SortedEntry) -> Result<(), EngineError> {
        self.ack(entry).await?;
        self.store.del(&entry.reference_uri).await?;
        Ok(())
    }

    /// Schedule another attempt further back (see [`decayed_priority`]).
    ///
    /// On the last retry nothing is written and the markers stay in place
    /// for the failure handler to clean up.
    pub async fn retry(&self, entry: &SortedEntry) -> Result<(), EngineError> {
        if entry.is_last_retry() {
            return Err(EngineError::RetriesExhausted {
                reference_uri: entry.reference_uri.clone(),
                retries: entry.current_retries,
            });
        }
        let mut next = entry.clone();
        next.priority = decayed_priority(entry.priority);
        self.re_enqueue(&next, entry.current_retries + 1)
            .await
            .map_err(|e| EngineError::Retry(format!("failed to retry: {e}")))?;
        self.ack(&next).await
    }
}
