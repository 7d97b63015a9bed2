//! Demo sorted-queue processor and failure handler.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use spindle_core::EngineError;
use spindle_core::app::{FailureHandler, SortedHandler, SortedQueue, Throttler};
use spindle_core::domain::{FailurePayload, FailureRecord, SortedEntry};
use tracing::{error, info, warn};

/// Runs every entry through the throttler and retries about 10% at random.
pub struct TestQueueConsumer {
    throttler: Throttler,
}

impl TestQueueConsumer {
    pub fn new(throttler: Throttler) -> Self {
        Self { throttler }
    }
}

#[async_trait]
impl SortedHandler for TestQueueConsumer {
    async fn handle(&self, mut entries: Vec<SortedEntry>, consumer_id: &str) -> Vec<SortedEntry> {
        info!(batch = entries.len(), consumer_id, "processing batch");
        for entry in &mut entries {
            let elapsed = match self.throttler.work(&entry.reference_uri).await {
                Ok(elapsed) => elapsed,
                Err(e) => {
                    entry.retry(format!("some work: {e}"));
                    continue;
                }
            };

            let roll: f32 = rand::thread_rng().gen_range(0.0..1.0);
            if roll <= 0.1 {
                warn!(reference_uri = %entry.reference_uri, roll, "entry failed randomly, retrying");
                entry.retry(format!("failed due to {roll} is less than 0.1"));
                continue;
            }
            info!(
                reference_uri = %entry.reference_uri,
                retries = entry.current_retries,
                priority = entry.priority,
                ?elapsed,
                "entry processed"
            );
        }
        entries
    }
}

/// Logs each failure and cleans up failed entries; the queue never does it.
pub struct TestQueueFailureHandler {
    queue: SortedQueue,
}

impl TestQueueFailureHandler {
    pub fn new(queue: SortedQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl FailureHandler for TestQueueFailureHandler {
    async fn handle(&self, failures: Vec<FailureRecord>, consumer_id: &str) {
        for failure in failures {
            warn!(consumer_id, failure = %failure, "handling failure");
            if let FailurePayload::Entry(entry) = &failure.payload {
                if let Err(e) = self.queue.clean_up(entry).await {
                    error!(reference_uri = %entry.reference_uri, error = %e, "failed to clean up");
                }
            }
        }
    }
}

/// Enqueue `count` entries with random priorities.
pub async fn seed(queue: &SortedQueue, count: usize) -> Result<Vec<String>, EngineError> {
    let mut references = Vec::with_capacity(count);
    for i in 0..count {
        let priority: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let reference = spindle_core::domain::ids::queue_uri(queue.name());
        let entry = SortedEntry::new(
            format!("demo entry {i}"),
            priority,
            reference.clone(),
            Duration::from_secs(60 * 60),
        );
        queue.enqueue(&entry).await?;
        references.push(reference);
    }
    Ok(references)
}
