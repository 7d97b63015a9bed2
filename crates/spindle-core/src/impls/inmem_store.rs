//! InMemoryStore - 開発用・テスト用のストア
//!
//! # 学習ポイント
//! - Mutex + Notify による blocking pop / blocking read
//! - TTL は読み出し時に遅延評価（lazy expiration）
//! - sorted set の同点は挿入順（Redis の辞書順とは異なる）

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ports::{Store, StoreError, StreamMessage};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct ScoredMember {
    member: String,
    score: f64,
    seq: u64,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    /// Index of the next message to deliver.
    next_index: usize,
    pending: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    messages: Vec<StreamMessage>,
    groups: HashMap<String, ConsumerGroup>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct InMemoryState {
    strings: HashMap<String, StoredValue>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<ScoredMember>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, MemoryStream>,
    next_seq: u64,
}

impl InMemoryState {
    fn live_string(&mut self, key: &str) -> Option<&StoredValue> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|v| v.is_expired(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }

    fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let no_group = || StoreError::NoGroup(format!("{stream}/{group}"));
        let s = self.streams.get_mut(stream).ok_or_else(no_group)?;
        let g = s.groups.get_mut(group).ok_or_else(no_group)?;

        let end = (g.next_index + count).min(s.messages.len());
        let batch: Vec<StreamMessage> = s.messages[g.next_index..end].to_vec();
        g.next_index = end;
        for m in &batch {
            g.pending.insert(m.id.clone());
        }
        Ok(batch)
    }
}

/// InMemoryStore は単一プロセス内で [`Store`] を実装
///
/// # 実装詳細
/// - 全データ構造を 1 つの Mutex で保護（await を跨いでロックしない）
/// - `rpush` / `xadd` で Notify して待機中の blocking 操作を起こす
///
/// # 使用例
/// ```ignore
/// let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
/// store.rpush("jobs", "gid://jobs/1").await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
    notify: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, InMemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Command("in-memory store lock poisoned".to_string()))
    }

    /// Score of `member` in sorted set `key` (for tests).
    pub fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        let state = self.state.lock().ok()?;
        state
            .zsets
            .get(key)?
            .iter()
            .find(|m| m.member == member)
            .map(|m| m.score)
    }

    /// Number of members in sorted set `key` (for tests).
    pub fn zcard(&self, key: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.zsets.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of messages appended to `stream` (for tests).
    pub fn xlen(&self, stream: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.streams.get(stream).map_or(0, |st| st.messages.len()))
            .unwrap_or(0)
    }

    /// All messages of `stream` in append order (for tests).
    pub fn xrange(&self, stream: &str) -> Vec<StreamMessage> {
        self.state
            .lock()
            .map(|s| {
                s.streams
                    .get(stream)
                    .map(|st| st.messages.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Ids delivered to `group` and not yet acknowledged (for tests).
    pub fn xpending(&self, stream: &str, group: &str) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.streams
                    .get(stream)
                    .and_then(|st| st.groups.get(group))
                    .map(|g| g.pending.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state()?;
        Ok(state.live_string(key).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.strings.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        if state.live_string(key).is_some() {
            return Ok(true);
        }
        Ok(state.lists.get(key).is_some_and(|l| !l.is_empty())
            || state.zsets.get(key).is_some_and(|z| !z.is_empty())
            || state.sets.get(key).is_some_and(|s| !s.is_empty())
            || state.hashes.get(key).is_some_and(|h| !h.is_empty())
            || state.streams.contains_key(key))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.strings.remove(key);
        state.lists.remove(key);
        state.zsets.remove(key);
        state.sets.remove(key);
        state.hashes.remove(key);
        state.streams.remove(key);
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut state = self.state()?;
            state
                .lists
                .entry(list.to_string())
                .or_default()
                .push_back(value.to_string());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // notified を先に登録してから状態を確認する（通知の取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state()?;
                if let Some(value) = state.lists.get_mut(list).and_then(VecDeque::pop_front) {
                    return Ok(Some(value));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        let zset = state.zsets.entry(key.to_string()).or_default();
        if zset.iter().any(|m| m.member == member) {
            return Ok(());
        }
        zset.push(ScoredMember {
            member: member.to_string(),
            score,
            seq,
        });
        Ok(())
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let mut state = self.state()?;
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        zset.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.seq.cmp(&b.seq)));
        let n = count.min(zset.len());
        Ok(zset
            .drain(..n)
            .map(|m| (m.member, m.score))
            .collect())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let set = state.sets.entry(key.to_string()).or_default();
        set.extend(members.iter().cloned());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let state = self.state()?;
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let state = self.state()?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn xgroup_create_mkstream(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Err(StoreError::GroupExists(format!("{stream}/{group}")));
        }
        s.groups.insert(group.to_string(), ConsumerGroup::default());
        Ok(())
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError> {
        let id = {
            let mut state = self.state()?;
            let s = state.streams.entry(stream.to_string()).or_default();
            s.next_id += 1;
            let id = format!("{}-0", s.next_id);
            s.messages.push(StreamMessage {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let deadline = block.map(|d| tokio::time::Instant::now() + d);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state()?;
                let batch = state.read_group(stream, group, count.max(1))?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(id);
        }
        Ok(())
    }
}
