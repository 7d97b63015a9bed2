//! Batch consumption and the consumer pool.
//!
//! # 1 batch のフロー
//! 1. ZPOPMIN(consuming)
//! 2. body 取得 + decode（失敗は poison として failure へ、retry しない）
//! 3. session 付与、exhausted（current > max）は failure へ
//! 4. 処理中マーカーを書く（失敗したら batch 全体を failure へ）
//! 5. handler 実行（panic 境界の内側）
//! 6. flag 付き → retry / flag なし → clean_up
//! 7. failure があれば handler に 1 回で渡す

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::options::SortedQueueOptions;
use super::{FailureHandler, SortedHandler, SortedQueue, processing_reference_key};
use crate::app::lifecycle::{ShutdownSignal, WorkerPool, panic_message};
use crate::domain::ids::is_valid_uri;
use crate::domain::{FailureRecord, SortedEntry};
use crate::error::EngineError;

/// What one pass did.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Processed successfully and cleaned up.
    pub acknowledged: Vec<String>,
    /// Re-enqueued for another attempt.
    pub retried: Vec<String>,
    /// Everything reported to the failure handler.
    pub failures: Vec<FailureRecord>,
    /// Reading the queue itself failed.
    pub read_failed: bool,
    /// The handler invocation panicked.
    pub panicked: bool,
}

impl BatchOutcome {
    pub fn is_idle(&self) -> bool {
        self.acknowledged.is_empty()
            && self.retried.is_empty()
            && self.failures.is_empty()
            && !self.read_failed
    }
}

impl SortedQueue {
    /// Run one pop-min pass.
    pub async fn consume_once(
        &self,
        consumer_id: &str,
        options: &SortedQueueOptions,
        handler: &Arc<dyn SortedHandler>,
        failure_handler: &dyn FailureHandler,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let popped = match self.store.zpopmin(&self.name, options.consuming.max(1)).await {
            Ok(popped) => popped,
            Err(e) => {
                error!(queue = %self.name, consumer_id, error = %e, "failed to read queue");
                outcome.read_failed = true;
                outcome.failures.push(FailureRecord::empty(e));
                failure_handler
                    .handle(outcome.failures.clone(), consumer_id)
                    .await;
                return outcome;
            }
        };
        if popped.is_empty() {
            return outcome;
        }

        let mut batch = Vec::with_capacity(popped.len());
        for (reference, _score) in popped {
            match self.load(&reference, options.max_retries).await {
                Ok(entry) if entry.has_exhausted_retries() => {
                    let err = EngineError::RetriesExhausted {
                        reference_uri: reference,
                        retries: entry.current_retries,
                    };
                    outcome.failures.push(FailureRecord::entry(err, entry));
                }
                Ok(entry) => batch.push(entry),
                Err(failure) => outcome.failures.push(failure),
            }
        }

        if !batch.is_empty() {
            match self.mark_processing(&batch).await {
                Ok(()) => self.run_batch(consumer_id, handler, batch, &mut outcome).await,
                Err(e) => {
                    // set と hash が片方だけ残らないように戻す
                    self.unmark(&batch).await;
                    for entry in batch {
                        outcome.failures.push(FailureRecord::entry(e.clone(), entry));
                    }
                }
            }
        }

        if !outcome.failures.is_empty() {
            failure_handler
                .handle(outcome.failures.clone(), consumer_id)
                .await;
        }
        outcome
    }

    async fn load(&self, reference: &str, max_retries: u32) -> Result<SortedEntry, FailureRecord> {
        if !is_valid_uri(reference) {
            let err = EngineError::InvalidReference(reference.to_string());
            return Err(FailureRecord::reference(err, reference));
        }
        let raw = match self.store.get(reference).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let err = EngineError::MissingEntry(reference.to_string());
                return Err(FailureRecord::reference(err, reference));
            }
            Err(e) => return Err(FailureRecord::reference(e, reference)),
        };
        let mut entry =
            SortedEntry::decode(&raw).map_err(|e| FailureRecord::value(e, reference, raw.clone()))?;
        entry.attach_session(max_retries, &self.name);
        Ok(entry)
    }

    async fn run_batch(
        &self,
        consumer_id: &str,
        handler: &Arc<dyn SortedHandler>,
        batch: Vec<SortedEntry>,
        outcome: &mut BatchOutcome,
    ) {
        let expected = batch.len();
        let checked_out = batch.clone();

        // handler の panic を worker まで伝播させない
        let invocation = {
            let handler = Arc::clone(handler);
            let consumer_id = consumer_id.to_string();
            tokio::spawn(async move { handler.handle(batch, &consumer_id).await })
        };

        match invocation.await {
            Ok(returned) => {
                if returned.len() != expected {
                    warn!(
                        queue = %self.name,
                        consumer_id,
                        expected,
                        returned = returned.len(),
                        "handler returned a different number of entries"
                    );
                }
                for entry in returned {
                    self.settle(entry, outcome).await;
                }
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                error!(queue = %self.name, consumer_id, panic = %message, "handler panicked");
                outcome.panicked = true;
                for mut entry in checked_out {
                    let processing = self
                        .store
                        .sismember(&processing_reference_key(&self.name), &entry.reference_uri)
                        .await;
                    if !matches!(processing, Ok(true)) {
                        continue;
                    }
                    entry.set_failure(format!("PANIC: {message}"));
                    match self.retry(&entry).await {
                        Ok(()) => outcome.retried.push(entry.reference_uri.clone()),
                        Err(e) => outcome.failures.push(FailureRecord::entry(e, entry)),
                    }
                }
            }
        }
    }

    async fn settle(&self, entry: SortedEntry, outcome: &mut BatchOutcome) {
        if entry.is_flagged() {
            debug!(
                queue = %self.name,
                reference_uri = %entry.reference_uri,
                failure = entry.current_failure().unwrap_or_default(),
                "retrying entry"
            );
            match self.retry(&entry).await {
                Ok(()) => outcome.retried.push(entry.reference_uri.clone()),
                Err(e) => outcome.failures.push(FailureRecord::entry(e, entry)),
            }
            return;
        }
        match self.clean_up(&entry).await {
            Ok(()) => outcome.acknowledged.push(entry.reference_uri.clone()),
            Err(e) => outcome.failures.push(FailureRecord::entry(e, entry)),
        }
    }

    /// Start `options.consumers` workers. Each recovers orphaned entries once,
    /// then consumes until shutdown.
    pub fn consume(
        &self,
        options: SortedQueueOptions,
        handler: Arc<dyn SortedHandler>,
        failure_handler: Arc<dyn FailureHandler>,
        shutdown: ShutdownSignal,
    ) -> WorkerPool {
        let options = options.normalize();
        let mut pool = WorkerPool::new(format!("sorted:{}", self.name));
        for _ in 0..options.consumers {
            let consumer_id = uuid::Uuid::new_v4().to_string();
            let queue = self.clone();
            let options = options.clone();
            let handler = Arc::clone(&handler);
            let failure_handler = Arc::clone(&failure_handler);
            let signal = shutdown.clone();
            pool.spawn(async move {
                queue
                    .worker_loop(consumer_id, options, handler, failure_handler, signal)
                    .await;
            });
        }
        pool
    }

    async fn worker_loop(
        &self,
        consumer_id: String,
        options: SortedQueueOptions,
        handler: Arc<dyn SortedHandler>,
        failure_handler: Arc<dyn FailureHandler>,
        mut shutdown: ShutdownSignal,
    ) {
        info!(queue = %self.name, consumer_id = %consumer_id, "sorted queue consumer started");
        self.recover(&consumer_id, failure_handler.as_ref()).await;

        while !shutdown.is_shutdown() {
            let outcome = self
                .consume_once(&consumer_id, &options, &handler, failure_handler.as_ref())
                .await;
            let pause = if outcome.read_failed {
                options.error_backoff
            } else {
                options.poll_interval
            };
            tokio::select! {
                _ = shutdown.wait() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(queue = %self.name, consumer_id = %consumer_id, "sorted queue consumer is done");
    }
}
