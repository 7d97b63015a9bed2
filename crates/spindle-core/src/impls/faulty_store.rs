//! Store wrapper that fails selected commands on demand (tests only).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::InMemoryStore;
use crate::ports::{Store, StoreError, StreamMessage};

#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: InMemoryStore,
    pub fail_zpopmin: AtomicBool,
    pub fail_hset_nx: AtomicBool,
    pub zpopmin_calls: AtomicUsize,
}

impl FaultyStore {
    fn check(flag: &AtomicBool, command: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("{command}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(key).await
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.inner.rpush(list, value).await
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.inner.blpop(list, timeout).await
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.inner.zadd_nx(key, member, score).await
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError> {
        self.zpopmin_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_zpopmin, "ZPOPMIN")?;
        self.inner.zpopmin(key, count).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        self.inner.sadd(key, members).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.inner.srem(key, member).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.sismember(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        Self::check(&self.fail_hset_nx, "HSETNX")?;
        self.inner.hset_nx(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.inner.hdel(key, field).await
    }

    async fn xgroup_create_mkstream(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        self.inner.xgroup_create_mkstream(stream, group).await
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError> {
        self.inner.xadd(stream, fields).await
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.inner
            .xread_group(stream, group, consumer, count, block)
            .await
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        self.inner.xack(stream, group, id).await
    }
}
