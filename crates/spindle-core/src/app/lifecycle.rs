//! Lifecycle - shutdown signal, worker pool, sync group
//!
//! # 設計原則
//! - shutdown は協調的: worker はループの区切りでのみ signal を確認する
//! - 各 engine は自分の [`WorkerPool`] を所有する（放置された task を作らない）
//! - 終了待ちは timeout 付き。timeout は報告するだけで worker を止めない
//!
//! # 使用例
//! ```ignore
//! let shutdown = Shutdown::new();
//! let pool = queue.consume(options, handler, failures, shutdown.signal());
//!
//! let group = SyncGroup::new();
//! group.add_completion("sorted", pool.completion());
//!
//! shutdown.trigger();
//! if group.wait_timeout(Duration::from_secs(30)).await {
//!     warn!("shutdown timed out");
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default wait of [`SyncGroup::wait`].
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown trigger. Dropping it counts as a shutdown for every signal.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        // receiver がいなくても値は残す
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable observer of a [`Shutdown`].
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been triggered (or the trigger dropped).
    pub async fn wait(&mut self) {
        // Err は sender drop = shutdown 扱い
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Outstanding-work counter shared by completions and sync groups.
#[derive(Clone)]
struct Pending(Arc<watch::Sender<usize>>);

impl Pending {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self(Arc::new(tx))
    }

    fn enter(&self) -> PendingToken {
        self.0.send_modify(|n| *n += 1);
        PendingToken(Arc::clone(&self.0))
    }

    fn is_drained(&self) -> bool {
        *self.0.borrow() == 0
    }

    async fn drained(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements on drop, so a panicking worker still counts as exited.
struct PendingToken(Arc<watch::Sender<usize>>);

impl Drop for PendingToken {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Gate that opens once every worker of a pool has exited.
#[derive(Clone)]
pub struct Completion {
    pending: Pending,
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        self.pending.is_drained()
    }

    pub async fn wait(&self) {
        self.pending.drained().await;
    }
}

/// Owned set of worker tasks.
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<()>>,
    completion: Completion,
}

impl WorkerPool {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: Vec::new(),
            completion: Completion {
                pending: Pending::new(),
            },
        }
    }

    pub(crate) fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.completion.pending.enter();
        self.handles.push(tokio::spawn(async move {
            let _token = token;
            worker.await;
        }));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(pool = %self.name, error = %e, "worker ended abnormally");
            }
        }
    }

    /// Wait at most `timeout`. Returns `true` when the wait timed out.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.completion.wait())
            .await
            .is_err()
    }
}

/// Marks one unit of tracked work done when dropped.
pub struct DoneGuard {
    _token: PendingToken,
}

impl DoneGuard {
    pub fn done(self) {}
}

/// Wait group over named units of work and pool completions.
pub struct SyncGroup {
    pending: Pending,
}

impl SyncGroup {
    pub fn new() -> Self {
        Self {
            pending: Pending::new(),
        }
    }

    pub fn add(&self, name: &str) -> DoneGuard {
        tracing::debug!(name, "tracking work");
        DoneGuard {
            _token: self.pending.enter(),
        }
    }

    /// Track `completion`; it is counted done once its pool has exited.
    pub fn add_completion(&self, name: &str, completion: Completion) {
        let token = self.pending.enter();
        let name = name.to_string();
        tokio::spawn(async move {
            completion.wait().await;
            info!(name = %name, "completed");
            drop(token);
        });
    }

    pub async fn wait(&self) -> bool {
        self.wait_timeout(DEFAULT_WAIT_TIMEOUT).await
    }

    /// Returns `true` when `timeout` elapsed first. Tracked work keeps
    /// running either way.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.pending.drained())
            .await
            .is_err()
    }
}

impl Default for SyncGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Text of a handler panic caught at a `tokio::spawn` boundary.
pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn signal_observes_trigger_and_drop() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_shutdown());

        shutdown.trigger();
        assert!(signal.is_shutdown());
        signal.wait().await;

        let dropped = Shutdown::new();
        let mut orphan = dropped.signal();
        drop(dropped);
        assert!(orphan.is_shutdown());
        orphan.wait().await;
    }

    #[tokio::test]
    async fn pool_completes_after_every_worker_exits() {
        let shutdown = Shutdown::new();
        let exited = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("test");
        for _ in 0..3 {
            let mut signal = shutdown.signal();
            let exited = Arc::clone(&exited);
            pool.spawn(async move {
                signal.wait().await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }

        let completion = pool.completion();
        assert_eq!(pool.len(), 3);
        assert!(pool.join_timeout(Duration::from_millis(20)).await);
        assert!(!completion.is_complete());

        shutdown.trigger();
        assert!(!pool.join_timeout(Duration::from_secs(1)).await);
        assert!(completion.is_complete());
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        pool.join().await;
    }

    #[tokio::test]
    async fn panicking_worker_still_completes() {
        let mut pool = WorkerPool::new("panics");
        pool.spawn(async {
            tokio::task::yield_now().await;
            panic!("boom");
        });
        assert!(!pool.join_timeout(Duration::from_secs(1)).await);
        pool.join().await;
    }

    #[tokio::test]
    async fn sync_group_waits_for_guards_and_completions() {
        let group = SyncGroup::new();
        let guard = group.add("manual");

        let shutdown = Shutdown::new();
        let mut pool = WorkerPool::new("pool");
        let mut signal = shutdown.signal();
        pool.spawn(async move { signal.wait().await });
        group.add_completion("pool", pool.completion());

        assert!(group.wait_timeout(Duration::from_millis(20)).await);

        guard.done();
        shutdown.trigger();
        assert!(!group.wait_timeout(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn timeout_does_not_stop_tracked_work() {
        let group = SyncGroup::new();
        let guard = group.add("slow");
        let finished = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                guard.done();
            })
        };

        assert!(group.wait_timeout(Duration::from_millis(5)).await);
        handle.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!group.wait().await);
    }
}
