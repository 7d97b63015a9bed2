//! RedisStore - 本番用のストア
//!
//! Ordinary commands share one `ConnectionManager` (multiplexed, reconnects on
//! failure). Blocking commands (`BLPOP`, `XREADGROUP ... BLOCK`) would stall
//! every other caller on a multiplexed connection, so each of them opens its
//! own connection for the duration of the call.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::debug;

use crate::error::EngineError;
use crate::ports::{Store, StoreError, StreamMessage};

fn store_error(e: RedisError) -> StoreError {
    match e.code() {
        Some("NOGROUP") => StoreError::NoGroup(e.to_string()),
        Some("BUSYGROUP") => StoreError::GroupExists(e.to_string()),
        _ if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() => {
            StoreError::Connection(e.to_string())
        }
        _ => StoreError::Command(e.to_string()),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    ///
    /// Failure here is a setup error and is not retried.
    pub async fn connect(redis_url: &str) -> Result<Self, EngineError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| EngineError::Connect(e.to_string()))?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        debug!(reply = %pong, "connected to redis");

        Ok(Self { client, conn })
    }

    async fn dedicated(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(store_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl.filter(|d| !d.is_zero()) {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_error)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await.map_err(store_error)?;
        Ok(exists)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(store_error)?;
        Ok(())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(list, value).await.map_err(store_error)?;
        Ok(())
    }

    async fn blpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.dedicated().await?;
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(list)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(popped)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, members).await.map_err(store_error)?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await.map_err(store_error)?;
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let is_member: bool = conn.sismember(key, member).await.map_err(store_error)?;
        Ok(is_member)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(store_error)?;
        Ok(members)
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_nx(key, field, value).await.map_err(store_error)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await.map_err(store_error)?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await.map_err(store_error)?;
        Ok(())
    }

    async fn xgroup_create_mkstream(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .xgroup_create_mkstream(stream, group, "0")
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await.map_err(store_error)?;
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.dedicated().await?;
        // BLOCK 0 = 無期限に待つ
        let block_ms = block.map_or(0, |d| usize::try_from(millis(d)).unwrap_or(usize::MAX));
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(store_error)?;

        let mut messages = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let mut fields = std::collections::HashMap::with_capacity(entry.map.len());
                for (field, value) in &entry.map {
                    let value: String = redis::from_redis_value(value)
                        .map_err(|e| StoreError::Decode(format!("{field}: {e}")))?;
                    fields.insert(field.clone(), value);
                }
                messages.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(messages)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.xack(stream, group, &[id]).await.map_err(store_error)?;
        Ok(())
    }
}
