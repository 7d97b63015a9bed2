//! LeaseLock - ストア上の TTL 付き排他ロック
//!
//! # 実装詳細
//! - `SET LOCK::<key> LOCK NX PX <ttl>` を成功するまで 1ms 間隔で再試行
//! - 取得タイムアウトはない（ストアが応答しない間は待ち続ける）
//! - release はキー名で DEL するだけ
//!
//! # 既知の制約
//! fencing token がないため、TTL 切れ後に別の holder が取得したロックを
//! 古い holder の release が消してしまう。TTL より長い critical section は
//! 2 つ目の取得者と並行して走りうる。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::ports::{Store, StoreError};

pub const LOCK_PREFIX: &str = "LOCK::";
pub const LOCK_VALUE: &str = "LOCK";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

const SPIN_INTERVAL: Duration = Duration::from_millis(1);

pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_ttl(store, DEFAULT_LOCK_TTL)
    }

    pub fn with_ttl(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Spin until the lease on `key` is ours.
    pub async fn acquire(&self, key: &str) -> Lease {
        let lock_key = lock_key(key);
        loop {
            match self.store.set_nx(&lock_key, LOCK_VALUE, self.ttl).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => debug!(key = %lock_key, error = %e, "lock attempt failed"),
            }
            tokio::time::sleep(SPIN_INTERVAL).await;
        }
        Lease {
            store: Arc::clone(&self.store),
            key: lock_key,
        }
    }
}

/// A held lease. Dropping it without [`release`](Lease::release) leaves the
/// key to expire on its TTL.
#[must_use = "a lease is only freed by release() or TTL expiry"]
pub struct Lease {
    store: Arc<dyn Store>,
    key: String,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(self) -> Result<(), StoreError> {
        self.store.del(&self.key).await.inspect_err(|e| {
            warn!(key = %self.key, error = %e, "failed to release lock");
        })
    }
}
