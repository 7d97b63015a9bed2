//! Stream consumer group
//!
//! # 配送モデル
//! - 受信した message はまず XACK する（handler 実行前）
//! - handler が失敗したら retries と error を載せた新しい message を XADD する
//! - retry 予算を使い切ったらログのみ（failure handler はない）
//!
//! ack が先なので、handler 実行中に worker が落ちた message は再配送されない。

pub mod options;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{ShutdownSignal, WorkerPool, panic_message};
use crate::domain::StreamEntry;
use crate::error::{EngineError, HandlerError};
use crate::ports::{Store, StoreError, StreamMessage};

pub use self::options::StreamConsumerOptions;

#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// `entry.retries` already counts this delivery.
    async fn handle(&self, entry: StreamEntry, consumer_id: &str) -> Result<(), HandlerError>;
}

/// Append `value` as a fresh entry (retries 0). Returns the entry id.
pub async fn append(store: &dyn Store, stream: &str, value: &str) -> Result<Uuid, EngineError> {
    let entry = StreamEntry::new(Uuid::new_v4(), value);
    append_entry(store, stream, &entry).await?;
    Ok(entry.id)
}

async fn append_entry(store: &dyn Store, stream: &str, entry: &StreamEntry) -> Result<String, StoreError> {
    let fields = entry.to_fields();
    let pairs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
    store.xadd(stream, &pairs).await
}

/// Create the group if needed and start `options.counts` workers.
///
/// An existing group is fine; any other creation error is a setup failure.
pub async fn register_consumer(
    store: Arc<dyn Store>,
    stream: impl Into<String>,
    group: impl Into<String>,
    handler: Arc<dyn StreamHandler>,
    options: StreamConsumerOptions,
    shutdown: ShutdownSignal,
) -> Result<WorkerPool, EngineError> {
    let options = options.normalize();
    let stream = stream.into();
    let group = group.into();
    ensure_group(store.as_ref(), &stream, &group).await?;

    let mut pool = WorkerPool::new(format!("stream:{stream}/{group}"));
    for _ in 0..options.counts {
        let worker = StreamWorker {
            store: Arc::clone(&store),
            stream: stream.clone(),
            group: group.clone(),
            consumer_id: Uuid::new_v4().to_string(),
            handler: Arc::clone(&handler),
            options: options.clone(),
        };
        let signal = shutdown.clone();
        pool.spawn(async move { worker.run(signal).await });
    }
    Ok(pool)
}

async fn ensure_group(store: &dyn Store, stream: &str, group: &str) -> Result<(), StoreError> {
    match store.xgroup_create_mkstream(stream, group).await {
        Ok(()) => {
            info!(stream, group, "created consumer group");
            Ok(())
        }
        Err(StoreError::GroupExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

struct StreamWorker {
    store: Arc<dyn Store>,
    stream: String,
    group: String,
    consumer_id: String,
    handler: Arc<dyn StreamHandler>,
    options: StreamConsumerOptions,
}

impl StreamWorker {
    async fn run(self, mut shutdown: ShutdownSignal) {
        info!(stream = %self.stream, consumer_id = %self.consumer_id, "stream consumer started");
        while !shutdown.is_shutdown() {
            let read = tokio::select! {
                _ = shutdown.wait() => break,
                read = self.store.xread_group(
                    &self.stream,
                    &self.group,
                    &self.consumer_id,
                    self.options.read_count,
                    self.options.block,
                ) => read,
            };

            match read {
                Ok(messages) => {
                    for message in messages {
                        self.process(message).await;
                    }
                }
                Err(StoreError::NoGroup(_)) => {
                    warn!(stream = %self.stream, group = %self.group, "consumer group missing, recreating");
                    if let Err(e) = ensure_group(self.store.as_ref(), &self.stream, &self.group).await {
                        error!(stream = %self.stream, consumer_id = %self.consumer_id, error = %e, "failed to create stream");
                        self.back_off(&mut shutdown).await;
                    }
                }
                Err(e) => {
                    error!(stream = %self.stream, consumer_id = %self.consumer_id, error = %e, "failed to read stream");
                    self.back_off(&mut shutdown).await;
                }
            }
        }
        info!(stream = %self.stream, consumer_id = %self.consumer_id, "stream consumer stopped");
    }

    async fn back_off(&self, shutdown: &mut ShutdownSignal) {
        tokio::select! {
            _ = shutdown.wait() => {}
            _ = tokio::time::sleep(self.options.error_backoff) => {}
        }
    }

    async fn process(&self, message: StreamMessage) {
        if let Err(e) = self.store.xack(&self.stream, &self.group, &message.id).await {
            warn!(stream = %self.stream, message_id = %message.id, error = %e, "failed to ack stream entry");
        }

        let entry = match StreamEntry::from_fields(&message.fields) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(stream = %self.stream, message_id = %message.id, error = %e, "dropping undecodable stream entry");
                return;
            }
        };
        let entry = entry
            .with_increased_tries()
            .with_max_retries(self.options.retries);

        // panic しても worker は止めず、失敗として retry に回す
        let invocation = {
            let handler = Arc::clone(&self.handler);
            let consumer_id = self.consumer_id.clone();
            let entry = entry.clone();
            tokio::spawn(async move { handler.handle(entry, &consumer_id).await })
        };
        let handler_error = match invocation.await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(join_error) => {
                let message = panic_message(join_error);
                error!(stream = %self.stream, consumer_id = %self.consumer_id, entry_id = %entry.id, panic = %message, "stream handler panicked");
                HandlerError::new(format!("PANIC: {message}"))
            }
        };

        if entry.retries < self.options.retries {
            debug!(stream = %self.stream, entry_id = %entry.id, retries = entry.retries, "re-appending failed entry");
            let retry = entry.with_error(handler_error.message());
            if let Err(e) = append_entry(self.store.as_ref(), &self.stream, &retry).await {
                error!(stream = %self.stream, entry_id = %retry.id, error = %e, "failed to re-append stream entry");
            }
        } else {
            error!(
                stream = %self.stream,
                consumer_id = %self.consumer_id,
                entry_id = %entry.id,
                retries = entry.retries,
                error = %handler_error,
                "retries exhausted for stream entry"
            );
        }
    }
}
