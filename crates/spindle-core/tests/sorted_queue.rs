use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spindle_core::EngineError;
use spindle_core::app::sorted::{processing_priority_key, processing_reference_key};
use spindle_core::app::{FailureHandler, Shutdown, SortedHandler, SortedQueue, SortedQueueOptions};
use spindle_core::domain::{FailurePayload, FailureRecord, SortedEntry};
use spindle_core::impls::InMemoryStore;
use spindle_core::ports::Store;

/// Records batches; flags entries whose value is "retry".
#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<(String, u32)>>>,
}

#[async_trait]
impl SortedHandler for Recorder {
    async fn handle(&self, mut entries: Vec<SortedEntry>, _consumer_id: &str) -> Vec<SortedEntry> {
        self.batches.lock().unwrap().push(
            entries
                .iter()
                .map(|e| (e.reference_uri.clone(), e.current_retries))
                .collect(),
        );
        for e in &mut entries {
            if e.value == "retry" {
                e.retry("asked to retry");
            }
        }
        entries
    }
}

#[derive(Default)]
struct Failures(Mutex<Vec<FailureRecord>>);

#[async_trait]
impl FailureHandler for Failures {
    async fn handle(&self, failures: Vec<FailureRecord>, _consumer_id: &str) {
        assert!(!failures.is_empty());
        self.0.lock().unwrap().extend(failures);
    }
}

fn entry(reference: &str, value: &str, priority: f64) -> SortedEntry {
    SortedEntry::new(value, priority, reference, Duration::ZERO)
}

fn options(consuming: usize) -> SortedQueueOptions {
    SortedQueueOptions {
        consuming,
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn first_batch_holds_the_two_lowest_priorities() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "scenario");
    for (reference, priority) in [("gid://s/a", 0.5), ("gid://s/b", 0.1), ("gid://s/c", 0.9)] {
        queue.enqueue(&entry(reference, "ok", priority)).await.unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn SortedHandler> = recorder.clone();
    queue
        .consume_once("c1", &options(2), &handler, &Failures::default())
        .await;

    let batches = recorder.batches.lock().unwrap();
    let refs: Vec<&str> = batches[0].iter().map(|(r, _)| r.as_str()).collect();
    assert_eq!(refs, vec!["gid://s/b", "gid://s/a"]);
    assert_eq!(store.zcard("scenario"), 1);
}

#[tokio::test]
async fn lower_priority_is_dequeued_first_with_batch_size_one() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store, "order");
    queue.enqueue(&entry("gid://o/late", "ok", 2.0)).await.unwrap();
    queue.enqueue(&entry("gid://o/early", "ok", 1.0)).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn SortedHandler> = recorder.clone();
    let failures = Failures::default();
    queue.consume_once("c1", &options(1), &handler, &failures).await;
    queue.consume_once("c1", &options(1), &handler, &failures).await;

    let batches = recorder.batches.lock().unwrap();
    assert_eq!(batches[0][0].0, "gid://o/early");
    assert_eq!(batches[1][0].0, "gid://o/late");
}

#[tokio::test]
async fn retried_entry_comes_back_until_its_budget_is_spent() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "budget");
    queue.enqueue(&entry("gid://b/1", "retry", 1.0)).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn SortedHandler> = recorder.clone();
    let failures = Failures::default();
    let opts = SortedQueueOptions {
        max_retries: 2,
        ..options(1)
    };

    let mut scores = Vec::new();
    for _ in 0..3 {
        if let Some(score) = store.zscore("budget", "gid://b/1") {
            scores.push(score);
        }
        queue.consume_once("c1", &opts, &handler, &failures).await;
    }

    let seen: Vec<u32> = recorder.batches.lock().unwrap().iter().map(|b| b[0].1).collect();
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(scores.windows(2).all(|w| w[1] > w[0]));

    let reported = failures.0.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(matches!(reported[0].error, EngineError::RetriesExhausted { retries: 2, .. }));
    assert!(matches!(reported[0].payload, FailurePayload::Entry(_)));
}

#[tokio::test]
async fn entry_past_its_budget_goes_straight_to_failures() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "exhausted");
    let stale = entry("gid://x/1", "ok", 1.0);
    store.set("gid://x/1", &stale.encode(4), None).await.unwrap();
    store.zadd_nx("exhausted", "gid://x/1", 1.0).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let handler: Arc<dyn SortedHandler> = recorder.clone();
    let failures = Failures::default();
    let outcome = queue
        .consume_once("c1", &options(10), &handler, &failures)
        .await;

    assert!(recorder.batches.lock().unwrap().is_empty());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(failures.0.lock().unwrap()[0].reference_uri(), Some("gid://x/1"));
}

#[tokio::test]
async fn pool_recovers_orphans_then_processes_them() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "crash");

    // consumer が処理中に落ちた状態: body とマーカーだけが残る
    let orphan = entry("gid://c/1", "ok", 0.3);
    store.set("gid://c/1", &orphan.encode(0), None).await.unwrap();
    store
        .sadd(&processing_reference_key("crash"), &["gid://c/1".to_string()])
        .await
        .unwrap();
    store
        .hset_nx(&processing_priority_key("crash"), "gid://c/1", "0.3")
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let shutdown = Shutdown::new();
    let pool = queue.consume(
        options(10),
        recorder.clone(),
        Arc::new(Failures::default()),
        shutdown.signal(),
    );

    eventually(|| !recorder.batches.lock().unwrap().is_empty()).await;
    shutdown.trigger();
    assert!(!pool.join_timeout(Duration::from_secs(2)).await);

    assert_eq!(recorder.batches.lock().unwrap()[0][0].0, "gid://c/1");
    assert!(!store.exists("gid://c/1").await.unwrap());
    assert!(
        store
            .smembers(&processing_reference_key("crash"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn recovery_restores_original_priority() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "revive");
    store
        .sadd(&processing_reference_key("revive"), &["gid://r/1".to_string()])
        .await
        .unwrap();
    store
        .hset_nx(&processing_priority_key("revive"), "gid://r/1", "0.42")
        .await
        .unwrap();

    let outcome = queue.recover("c1", &Failures::default()).await;

    assert_eq!(outcome.recovered, vec!["gid://r/1".to_string()]);
    assert_eq!(store.zscore("revive", "gid://r/1"), Some(0.42));
    assert!(
        store
            .hget(&processing_priority_key("revive"), "gid://r/1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn several_workers_share_one_queue_without_duplicates() {
    let store = Arc::new(InMemoryStore::new());
    let queue = SortedQueue::new(store.clone(), "shared");
    for i in 0..20 {
        let reference = format!("gid://shared/{i}");
        queue
            .enqueue(&entry(&reference, "ok", f64::from(i)))
            .await
            .unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let shutdown = Shutdown::new();
    let pool = queue.consume(
        SortedQueueOptions {
            consumers: 3,
            ..options(2)
        },
        recorder.clone(),
        Arc::new(Failures::default()),
        shutdown.signal(),
    );
    assert_eq!(pool.len(), 3);

    let total = || {
        recorder
            .batches
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .sum::<usize>()
    };
    eventually(|| total() == 20).await;
    shutdown.trigger();
    pool.join().await;

    let mut seen: Vec<String> = recorder
        .batches
        .lock()
        .unwrap()
        .iter()
        .flatten()
        .map(|(r, _)| r.clone())
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 20);
}
