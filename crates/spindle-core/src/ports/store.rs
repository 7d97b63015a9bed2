//! Store port - 共有ストア（Redis または InMemory）
//!
//! The engine talks to the shared store only through this trait. Every
//! operation is a single store command; there is no transaction that spans
//! two calls, so callers must tolerate a crash between any two of them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// StoreError はストア操作のエラー
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    /// The consumer group does not exist (Redis `NOGROUP`).
    #[error("consumer group does not exist: {0}")]
    NoGroup(String),

    /// The consumer group already exists (Redis `BUSYGROUP`).
    #[error("consumer group already exists: {0}")]
    GroupExists(String),

    #[error("unexpected store reply: {0}")]
    Decode(String),
}

/// One message read from a stream through a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Store は key/value + list + sorted set + set + hash + stream のストア
///
/// # 設計原則
/// - 各メソッドは 1 コマンドに対応（原子性はコマンド単位のみ）
/// - blocking 操作（`blpop`, `xread_group`）は待ち時間の上限を呼び出し側が決める
/// - "値がない" は `Ok(None)` / 空 Vec で表し、エラーにはしない
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value; `ttl = None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomic set-if-absent. Returns `true` when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Pop from the head of `list`, waiting at most `timeout`.
    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Add `member` at `score` unless it is already in the set.
    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Pop up to `count` members with the lowest scores, lowest first.
    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// Create `group` on `stream` starting at id `0`, creating the stream if
    /// needed. An existing group is reported as [`StoreError::GroupExists`].
    async fn xgroup_create_mkstream(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Append a message with an auto-generated id; returns that id.
    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError>;

    /// Read new messages (`>`) for `consumer`. `block = None` waits forever.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError>;
}
