use std::sync::Arc;

use spindle_core::app::FifoQueue;
use spindle_core::domain::FifoEntry;
use spindle_core::impls::InMemoryStore;
use spindle_core::ports::Store;

#[tokio::test]
async fn value_round_trips_and_body_is_removed() {
    let store = Arc::new(InMemoryStore::new());
    let queue = FifoQueue::new(store.clone(), "mail");

    let reference = queue.enqueue(FifoEntry::new("X")).await.unwrap();
    assert!(reference.starts_with("gid://mail/"));

    let popped = queue.pop().await.unwrap().expect("entry");
    assert_eq!(popped.value, "X");
    assert!(!store.exists(&reference).await.unwrap());
}

#[tokio::test]
async fn duplicate_reference_yields_one_stored_entry() {
    let store = Arc::new(InMemoryStore::new());
    let queue = FifoQueue::new(store.clone(), "mail");

    let report = queue
        .enqueue_all(vec![
            FifoEntry::with_reference("a", "gid://mail/same"),
            FifoEntry::with_reference("b", "gid://mail/same"),
        ])
        .await;
    assert_eq!(report.references, vec!["gid://mail/same", "gid://mail/same"]);

    assert_eq!(queue.pop().await.unwrap().unwrap().value, "a");
    assert!(queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn entries_come_out_in_insertion_order() {
    let store = Arc::new(InMemoryStore::new());
    let queue = FifoQueue::new(store, "ordered");
    for value in ["1", "2", "3"] {
        queue.enqueue(FifoEntry::new(value)).await.unwrap();
    }
    let mut values = Vec::new();
    while let Some(entry) = queue.pop().await.unwrap() {
        values.push(entry.value);
    }
    assert_eq!(values, vec!["1", "2", "3"]);
}
