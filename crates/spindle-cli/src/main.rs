//! Demo wiring: sorted queue, user stream and FIFO queue against Redis.
//!
//! Ctrl-C triggers shutdown; the process then waits (bounded) for every pool.

mod test_queue;
mod users;

use std::sync::Arc;

use async_trait::async_trait;
use spindle_core::app::{
    FifoConsumerOptions, FifoHandler, FifoQueue, Shutdown, SortedQueue, SortedQueueOptions,
    StreamConsumerOptions, SyncGroup, Throttler, ThrottlerOptions, stream,
};
use spindle_core::domain::FifoEntry;
use spindle_core::impls::RedisStore;
use spindle_core::ports::Store;
use spindle_core::{EngineConfig, EngineError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::test_queue::{TestQueueConsumer, TestQueueFailureHandler, seed};
use crate::users::UserCreationConsumer;

struct LogFifo;

#[async_trait]
impl FifoHandler for LogFifo {
    async fn handle(&self, entries: Vec<FifoEntry>, consumer_id: &str) {
        for entry in entries {
            info!(consumer_id, reference_uri = %entry.reference_uri, value = %entry.value, "fifo entry");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // RUST_LOG で上書き可能
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("spindle_cli=info,spindle_core=info")),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = EngineConfig::from_env()?;
    info!(redis_url = %config.redis_url, "spindle starting");

    let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let shutdown = Shutdown::new();
    let group = SyncGroup::new();

    // (A) throttler
    let throttler = Throttler::new(shutdown.signal(), ThrottlerOptions::default());
    let replenish = throttler.initialize();
    let replenish_done = group.add("throttler");
    tokio::spawn(async move {
        let _ = replenish.await;
        replenish_done.done();
    });

    // (B) sorted queue
    let queue = SortedQueue::new(Arc::clone(&store), config.sorted_queue.clone());
    let seeded = seed(&queue, 5).await?;
    info!(queue = %queue.name(), seeded = seeded.len(), "seeded sorted queue");
    let sorted_pool = queue.consume(
        SortedQueueOptions {
            max_retries: config.sorted_max_retries,
            consuming: config.sorted_consuming,
            consumers: config.sorted_consumers,
            ..Default::default()
        },
        Arc::new(TestQueueConsumer::new(throttler.clone())),
        Arc::new(TestQueueFailureHandler::new(queue.clone())),
        shutdown.signal(),
    );
    group.add_completion("sorted queue", sorted_pool.completion());

    // (C) user stream
    let stream_pool = stream::register_consumer(
        Arc::clone(&store),
        config.stream.clone(),
        config.stream_group.clone(),
        Arc::new(UserCreationConsumer),
        StreamConsumerOptions::new(config.stream_consumers, config.stream_retries),
        shutdown.signal(),
    )
    .await?;
    group.add_completion("user stream", stream_pool.completion());
    stream::append(
        store.as_ref(),
        &config.stream,
        r#"{"name":"ada","email":"ada@example.com"}"#,
    )
    .await?;

    // (D) FIFO queue
    let fifo = FifoQueue::new(Arc::clone(&store), "demoFifo");
    let report = fifo
        .enqueue_all(vec![FifoEntry::new("first"), FifoEntry::new("second")])
        .await;
    for (reference, e) in &report.errors {
        warn!(reference_uri = %reference, error = %e, "fifo enqueue failed");
    }
    let fifo_pool = fifo.consume(
        FifoConsumerOptions::default(),
        Arc::new(LogFifo),
        shutdown.signal(),
    );
    group.add_completion("fifo queue", fifo_pool.completion());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
    info!("received shutdown signal");
    shutdown.trigger();

    if group.wait_timeout(config.shutdown_timeout).await {
        warn!(timeout = ?config.shutdown_timeout, "shutdown timed out, workers still running");
    } else {
        info!("shutdown complete");
    }
    Ok(())
}
