//! Queue store abstraction and its Redis implementation.
//!
//! Every piece of shared state lives behind single-key atomic commands, so
//! the trait only exposes those. Components hold an `Arc<dyn QueueStore>`
//! and never see a connection directly.
//!
//! # Connections
//!
//! `RedisStore` keeps two connections:
//!
//! - a shared [`ConnectionManager`] for ordinary commands (cloned per call);
//! - a dedicated connection for blocking pops, so a `BLPOP` waiting on an
//!   empty list never stalls the multiplexed command connection.
//!
//! Blocking pops on one store are serialized. Every long-running listener
//! (each daemon, each processor) takes its own store via
//! [`RedisStore::duplicate`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::QueueError;

/// Atomic list/set/string commands used by brokers, processors and daemons.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends `value` to the tail of the list at `key`.
    async fn rpush(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Prepends `value` to the head of the list at `key`.
    async fn lpush(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Pops from the head of `key`, waiting up to `timeout`.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Pops from the tail of `key`, waiting up to `timeout`.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Adds `member` to the set at `key`.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), QueueError>;

    /// Adds `member` to the sorted set at `key` with `score`.
    async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), QueueError>;

    /// Sets the string at `key`.
    async fn set(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Reads the string at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Publishes `message` on `channel`.
    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError>;

    /// Length of the list at `key`.
    async fn llen(&self, key: &str) -> Result<usize, QueueError>;

    /// Elements of the list at `key` between `start` and `stop` (inclusive,
    /// negative indexes count from the tail).
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, QueueError>;

    /// Members of the sorted set at `key` scored within `[min, max]`.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, QueueError>;

    /// Members of the set at `key`.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, QueueError>;
}

/// Blocking-command timeout in whole seconds. Zero would block forever.
fn blocking_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Redis-backed queue store.
pub struct RedisStore {
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Connection reserved for blocking pops.
    blocking: Mutex<ConnectionManager>,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if either connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let blocking = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(blocking),
        })
    }

    /// Returns a store sharing the command connection but owning a fresh
    /// connection for blocking pops.
    pub async fn duplicate(&self) -> Result<Self, QueueError> {
        let blocking = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client: self.client.clone(),
            redis: self.redis.clone(),
            blocking: Mutex::new(blocking),
        })
    }

    async fn blocking_pop(
        &self,
        command: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.blocking.lock().await;
        let result: Option<(String, String)> = redis::cmd(command)
            .arg(key)
            .arg(blocking_timeout_secs(timeout))
            .query_async(&mut *conn)
            .await?;
        Ok(result.map(|(_, value)| value))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn rpush(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.blocking_pop("BLPOP", key, timeout).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.blocking_pop("BRPOP", key, timeout).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(values)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.smembers(key).await?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_timeout_never_zero() {
        assert_eq!(blocking_timeout_secs(Duration::ZERO), 1);
        assert_eq!(blocking_timeout_secs(Duration::from_millis(200)), 1);
        assert_eq!(blocking_timeout_secs(Duration::from_secs(5)), 5);
        assert_eq!(blocking_timeout_secs(Duration::from_millis(5500)), 6);
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }
}
