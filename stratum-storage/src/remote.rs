//! Remote cache tier backends.
//!
//! [`RemoteTier`] is the seam between the tiered cache and whatever is on
//! the other side of the network. [`RedisTier`] is the production backend,
//! built on a multiplexed connection manager that reconnects with backoff.
//! [`InMemoryTier`] is a process-local backend available in all builds so
//! integration tests can exercise the tiered cache without a server.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use stratum_core::error::{Error, Result};
use tracing::info;

use crate::tiered::CacheConfig;

/// Backend for the remote cache tier. All values are opaque strings; TTL
/// handling is the backend's responsibility.
#[async_trait]
pub trait RemoteTier: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value. A zero TTL stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch several keys in one round trip, preserving order. Missing
    /// keys come back as `None`.
    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Redis-backed remote tier.
///
/// The connection manager multiplexes all operations over one connection
/// and transparently reconnects, so cloning it per call is cheap.
pub struct RedisTier {
    manager: ConnectionManager,
}

impl RedisTier {
    /// Connect to the given Redis URL and verify it responds.
    pub async fn connect(url: &str, config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::cache(format!("invalid redis url: {}", e)))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.max_retries)
            .set_factor(config.retry_delay.as_millis() as u64)
            .set_connection_timeout(config.connect_timeout)
            .set_response_timeout(config.response_timeout);

        let manager = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|e| Error::cache(format!("failed to connect to redis: {}", e)))?;

        let tier = Self { manager };
        tier.ping().await?;
        info!("Redis tier connected");
        Ok(tier)
    }
}

#[async_trait]
impl RemoteTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| Error::cache(format!("redis get failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| Error::cache(format!("redis set failed: {}", e)))
        } else {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|e| Error::cache(format!("redis set failed: {}", e)))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::cache(format!("redis del failed: {}", e)))
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        pipe.query_async(&mut conn)
            .await
            .map_err(|e| Error::cache(format!("redis pipeline failed: {}", e)))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Error::cache(format!("redis ping failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The connection manager closes with its last clone.
        Ok(())
    }
}

/// Counters exposed by [`InMemoryTier`] for test assertions.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryStats {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub batch_gets: u64,
}

/// Process-local [`RemoteTier`] backend with TTL support and operation
/// counters. Delete failures can be injected to exercise error paths.
#[derive(Default)]
pub struct InMemoryTier {
    entries: DashMap<String, (String, Option<Instant>)>,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    batch_gets: AtomicU64,
    fail_deletes: AtomicBool,
}

impl InMemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `delete` return an error.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> InMemoryStats {
        InMemoryStats {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            batch_gets: self.batch_gets.load(Ordering::Relaxed),
        }
    }

    /// Number of live entries, ignoring expiry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        match entry.1 {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(entry.0.clone()),
        }
    }
}

#[async_trait]
impl RemoteTier for InMemoryTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(Error::cache("injected delete failure"));
        }
        self.entries.remove(key);
        Ok(())
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.batch_gets.fetch_add(1, Ordering::Relaxed);
        Ok(keys.iter().map(|key| self.live_value(key)).collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
