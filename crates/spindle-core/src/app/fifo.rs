//! FifoQueue - list ベースの at-least-once キュー
//!
//! # フロー
//! - enqueue: 参照 URI を割り当て → 既存なら何もしない → lock 下で body SET(24h) + RPUSH
//! - pop: BLPOP(1s) → prefix 検証 → lock 下で GET + decode + DEL
//!
//! retry や priority はない。sorted queue と lock / 参照 URI の規約を共有する。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::lifecycle::{ShutdownSignal, WorkerPool, panic_message};
use super::lock::LeaseLock;
use crate::domain::FifoEntry;
use crate::domain::ids::{is_valid_uri, queue_uri};
use crate::error::EngineError;
use crate::ports::Store;

/// TTL of a stored FIFO body.
pub const FIFO_ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Bounded wait of one blocking pop.
pub const POP_WAIT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait FifoHandler: Send + Sync {
    /// Called with one to `count` entries popped in a single pass.
    async fn handle(&self, entries: Vec<FifoEntry>, consumer_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoConsumerOptions {
    pub consumers: usize,
    /// Pops attempted per polling pass.
    pub count: usize,
}

impl Default for FifoConsumerOptions {
    fn default() -> Self {
        Self {
            consumers: 1,
            count: 1,
        }
    }
}

impl FifoConsumerOptions {
    pub fn normalize(mut self) -> Self {
        self.consumers = self.consumers.max(1);
        self.count = self.count.max(1);
        self
    }
}

/// Result of [`FifoQueue::enqueue_all`]: every reference in input order, and
/// the errors keyed by reference.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub references: Vec<String>,
    pub errors: HashMap<String, EngineError>,
}

#[derive(Clone)]
pub struct FifoQueue {
    store: Arc<dyn Store>,
    lock: LeaseLock,
    name: String,
}

impl FifoQueue {
    /// An empty `name` gets a random `randomQueueName<n>`.
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        let mut name = name.into();
        if name.is_empty() {
            name = format!("randomQueueName{}", rand::random::<u32>());
        }
        Self {
            lock: LeaseLock::new(Arc::clone(&store)),
            store,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `entry` and push its reference. Re-submitting a reference that
    /// still exists returns it without a second push.
    pub async fn enqueue(&self, entry: FifoEntry) -> Result<String, EngineError> {
        let (reference, result) = self.enqueue_inner(entry).await;
        result.map(|()| reference)
    }

    pub async fn enqueue_all(&self, entries: impl IntoIterator<Item = FifoEntry>) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        for entry in entries {
            let (reference, result) = self.enqueue_inner(entry).await;
            if let Err(e) = result {
                report.errors.insert(reference.clone(), e);
            }
            report.references.push(reference);
        }
        report
    }

    async fn enqueue_inner(&self, mut entry: FifoEntry) -> (String, Result<(), EngineError>) {
        if entry.reference_uri.is_empty() {
            entry.reference_uri = queue_uri(&self.name);
        }
        let reference = entry.reference_uri.clone();

        match self.store.exists(&reference).await {
            Ok(true) => {
                debug!(queue = %self.name, reference_uri = %reference, "already enqueued");
                return (reference, Ok(()));
            }
            Ok(false) => {}
            Err(e) => return (reference, Err(e.into())),
        }

        let lease = self.lock.acquire(&reference).await;
        let result = self.persist(&entry).await;
        let _ = lease.release().await;
        (reference, result)
    }

    async fn persist(&self, entry: &FifoEntry) -> Result<(), EngineError> {
        self.store
            .set(&entry.reference_uri, &entry.encode(), Some(FIFO_ENTRY_TTL))
            .await?;
        self.store.rpush(&self.name, &entry.reference_uri).await?;
        Ok(())
    }

    /// Pop the head entry, waiting up to [`POP_WAIT`]. `Ok(None)` on timeout.
    pub async fn pop(&self) -> Result<Option<FifoEntry>, EngineError> {
        let Some(reference) = self.store.blpop(&self.name, POP_WAIT).await? else {
            return Ok(None);
        };
        if !is_valid_uri(&reference) {
            return Err(EngineError::InvalidReference(reference));
        }

        let lease = self.lock.acquire(&reference).await;
        let result = self.take(&reference).await;
        let _ = lease.release().await;
        result.map(Some)
    }

    async fn take(&self, reference: &str) -> Result<FifoEntry, EngineError> {
        let raw = self
            .store
            .get(reference)
            .await?
            .ok_or_else(|| EngineError::MissingEntry(reference.to_string()))?;
        let entry = FifoEntry::decode(&raw)?;
        self.store.del(reference).await?;
        Ok(entry)
    }

    /// Start `options.consumers` workers feeding `handler`.
    pub fn consume(
        &self,
        options: FifoConsumerOptions,
        handler: Arc<dyn FifoHandler>,
        shutdown: ShutdownSignal,
    ) -> WorkerPool {
        let options = options.normalize();
        let mut pool = WorkerPool::new(format!("fifo:{}", self.name));
        for _ in 0..options.consumers {
            let consumer_id = uuid::Uuid::new_v4().to_string();
            let queue = self.clone();
            let handler = Arc::clone(&handler);
            let signal = shutdown.clone();
            pool.spawn(async move {
                queue.worker_loop(consumer_id, options.count, handler, signal).await;
            });
        }
        pool
    }

    async fn worker_loop(
        &self,
        consumer_id: String,
        count: usize,
        handler: Arc<dyn FifoHandler>,
        shutdown: ShutdownSignal,
    ) {
        info!(queue = %self.name, consumer_id = %consumer_id, "fifo consumer started");
        while !shutdown.is_shutdown() {
            let mut batch = Vec::with_capacity(count);
            for _ in 0..count {
                match self.pop().await {
                    Ok(Some(entry)) => batch.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!(queue = %self.name, error = %e, "fifo pop failed"),
                }
            }
            if batch.is_empty() {
                continue;
            }
            // entry は pop 時に消えているので、panic はログに残すだけ
            let references: Vec<String> = batch.iter().map(|e| e.reference_uri.clone()).collect();
            let invocation = {
                let handler = Arc::clone(&handler);
                let consumer_id = consumer_id.clone();
                tokio::spawn(async move { handler.handle(batch, &consumer_id).await })
            };
            if let Err(join_error) = invocation.await {
                let message = panic_message(join_error);
                error!(
                    queue = %self.name,
                    consumer_id = %consumer_id,
                    references = ?references,
                    panic = %message,
                    "fifo handler panicked, entries dropped"
                );
            }
        }
        info!(queue = %self.name, consumer_id = %consumer_id, "fifo consumer stopped");
    }
}
