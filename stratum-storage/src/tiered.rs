//! Tiered cache: local tier in front of a remote tier.
//!
//! Reads check the local tier first and fall through to the remote tier,
//! back-filling the local tier on a remote hit. Writes go to both tiers.
//! Deletes hit the remote tier first and then clear the local entry
//! unconditionally, so a failed remote delete can never leave a stale
//! local entry shadowing it. A miss on both tiers is the [`Error::CacheMiss`] sentinel.
//!
//! The local tier always holds plain values; the compression hook applies
//! only on the remote path.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_core::error::{Error, Result};
use stratum_core::MetricsRegistry;
use tracing::{debug, info, warn};

use crate::compression::{Compression, NoopCompression};
use crate::local_cache::LocalCache;
use crate::remote::{RedisTier, RemoteTier};

/// Cadence of the gauge-republishing metrics loop.
const METRICS_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Tiered cache configuration. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Reconnect retries for the remote connection manager
    pub max_retries: usize,
    /// Base delay between reconnect attempts
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Whether the local tier participates at all
    pub local_cache_enabled: bool,
    /// TTL for local-tier entries (zero disables expiry)
    pub local_cache_ttl: Duration,
    /// Soft capacity of the local tier
    pub local_cache_capacity: usize,
    /// Apply the compression hook on the remote path
    pub compression_enabled: bool,
    /// Batch multi-key reads through a pipeline
    pub pipeline_enabled: bool,
    pub pipeline_batch_size: usize,
    /// Interval between local-tier sweeps
    pub eviction_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(3),
            local_cache_enabled: true,
            local_cache_ttl: Duration::from_secs(5 * 60),
            local_cache_capacity: 1000,
            compression_enabled: true,
            pipeline_enabled: true,
            pipeline_batch_size: 100,
            eviction_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Cache performance metrics. Callers receive copies, never live references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Total operations recorded, across both tiers
    pub operations: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    /// Running average over all recorded operations
    pub avg_operation_time: Duration,
}

impl CacheMetrics {
    fn observe(&mut self, duration: Duration) {
        self.operations += 1;
        let n = self.operations;
        self.avg_operation_time = Duration::from_secs_f64(
            (self.avg_operation_time.as_secs_f64() * (n - 1) as f64 + duration.as_secs_f64())
                / n as f64,
        );
    }
}

/// Two-tier cache over a [`RemoteTier`] backend.
pub struct TieredCache<R: RemoteTier> {
    remote: Arc<R>,
    local: Option<Arc<LocalCache>>,
    codec: Arc<dyn Compression>,
    config: CacheConfig,
    metrics: Arc<parking_lot::Mutex<CacheMetrics>>,
    registry: Arc<MetricsRegistry>,
    running: Arc<AtomicBool>,
}

impl TieredCache<RedisTier> {
    /// Connect the Redis backend and build the cache on top of it.
    pub async fn connect(
        url: &str,
        config: CacheConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let remote = RedisTier::connect(url, &config).await?;
        Ok(Self::new(remote, config, registry))
    }
}

impl<R: RemoteTier> TieredCache<R> {
    /// Build the cache over an already-connected backend, with the identity
    /// compression hook. Must be called from within a Tokio runtime; the
    /// background loops start here.
    pub fn new(remote: R, config: CacheConfig, registry: Arc<MetricsRegistry>) -> Self {
        Self::with_compression(remote, config, registry, NoopCompression)
    }

    pub fn with_compression(
        remote: R,
        config: CacheConfig,
        registry: Arc<MetricsRegistry>,
        codec: impl Compression,
    ) -> Self {
        let local = config.local_cache_enabled.then(|| {
            Arc::new(LocalCache::new(
                config.local_cache_capacity,
                config.local_cache_ttl,
            ))
        });

        let cache = Self {
            remote: Arc::new(remote),
            local,
            codec: Arc::new(codec),
            config,
            metrics: Arc::new(parking_lot::Mutex::new(CacheMetrics::default())),
            registry,
            running: Arc::new(AtomicBool::new(true)),
        };

        cache.spawn_eviction_loop();
        cache.spawn_metrics_loop();

        info!(
            "Tiered cache initialized: local={}, pipeline={}",
            cache.config.local_cache_enabled, cache.config.pipeline_enabled
        );
        cache
    }

    /// Look up a key, local tier first. A miss on both tiers is
    /// [`Error::CacheMiss`]; remote failures surface as their own errors.
    /// The operation duration is recorded whatever the outcome.
    pub async fn get(&self, key: &str) -> Result<String> {
        let start = Instant::now();
        let pattern = key_pattern(key);

        if let Some(local) = &self.local {
            if let Some(value) = local.get(key) {
                let mut m = self.metrics.lock();
                m.local_hits += 1;
                m.hits += 1;
                m.observe(start.elapsed());
                drop(m);
                self.registry
                    .cache_hits_total
                    .with_label_values(&["local", &pattern])
                    .inc();
                self.observe_duration("get", "local", start);
                return Ok(value);
            }
            self.metrics.lock().local_misses += 1;
            self.registry
                .cache_misses_total
                .with_label_values(&["local", &pattern])
                .inc();
        }

        let result = match self.remote.get(key).await {
            Ok(Some(raw)) => match self.decode(&raw) {
                Ok(value) => {
                    if let Some(local) = &self.local {
                        local.set(key, &value);
                    }
                    self.metrics.lock().hits += 1;
                    self.registry
                        .cache_hits_total
                        .with_label_values(&["remote", &pattern])
                        .inc();
                    Ok(value)
                }
                Err(e) => Err(e),
            },
            Ok(None) => {
                self.metrics.lock().misses += 1;
                self.registry
                    .cache_misses_total
                    .with_label_values(&["remote", &pattern])
                    .inc();
                Err(Error::CacheMiss)
            }
            Err(e) => Err(e),
        };

        self.metrics.lock().observe(start.elapsed());
        self.observe_duration("get", "remote", start);
        result
    }

    /// Write a value to both tiers. The remote tier gets the encoded form,
    /// the local tier the plain form; a remote failure leaves the local
    /// tier untouched.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let start = Instant::now();

        let result = match self.encode(value) {
            Ok(encoded) => self.remote.set(key, &encoded, ttl).await,
            Err(e) => Err(e),
        };

        let mut m = self.metrics.lock();
        if result.is_ok() {
            if let Some(local) = &self.local {
                local.set(key, value);
            }
            m.sets += 1;
        }
        m.observe(start.elapsed());
        drop(m);
        self.observe_duration("set", "remote", start);
        result
    }

    /// Delete a key from both tiers: remote first, then the local entry is
    /// cleared regardless of the remote result. Clearing last closes the
    /// window in which a concurrent read could repopulate the local tier
    /// from a remote value that is about to be deleted; clearing even on a
    /// failed remote delete keeps the local tier from serving a value the
    /// caller asked to remove.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();

        let result = self.remote.delete(key).await;
        if let Err(e) = &result {
            warn!("Remote delete failed for key pattern {}: {}", key_pattern(key), e);
        }

        if let Some(local) = &self.local {
            local.delete(key);
        }

        let mut m = self.metrics.lock();
        m.deletes += 1;
        m.observe(start.elapsed());
        drop(m);
        self.observe_duration("delete", "remote", start);
        result
    }

    /// Fetch many keys from the remote tier, pipelined in batches. The
    /// local tier is bypassed; only keys found remotely appear in the map.
    pub async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let start = Instant::now();
        let result = self.get_multi_inner(keys).await;
        self.metrics.lock().observe(start.elapsed());
        self.observe_duration("get_multi", "remote", start);
        result
    }

    async fn get_multi_inner(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }

        if self.config.pipeline_enabled {
            let batch_size = self.config.pipeline_batch_size.max(1);
            for chunk in keys.chunks(batch_size) {
                let values = self.remote.get_batch(chunk).await?;
                for (key, raw) in chunk.iter().zip(values) {
                    self.collect_multi(key, raw, &mut found)?;
                }
            }
        } else {
            for key in keys {
                let raw = self.remote.get(key).await?;
                self.collect_multi(key, raw, &mut found)?;
            }
        }
        Ok(found)
    }

    /// Look up a key and deserialize its JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get(key).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Serialize a value to JSON and write it to both tiers.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.remote.ping().await
    }

    /// Snapshot of the cache metrics (copy).
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().clone()
    }

    /// Current size of the local tier (zero when disabled).
    pub fn local_len(&self) -> usize {
        self.local.as_ref().map(|l| l.len()).unwrap_or(0)
    }

    /// Stop the background loops and close the remote backend.
    pub async fn close(&self) -> Result<()> {
        info!("Closing tiered cache");
        self.running.store(false, Ordering::Relaxed);
        if let Some(local) = &self.local {
            local.clear();
        }
        self.remote.close().await
    }

    fn collect_multi(
        &self,
        key: &str,
        raw: Option<String>,
        found: &mut HashMap<String, String>,
    ) -> Result<()> {
        let pattern = key_pattern(key);
        match raw {
            Some(raw) => {
                let value = self.decode(&raw)?;
                found.insert(key.to_string(), value);
                self.metrics.lock().hits += 1;
                self.registry
                    .cache_hits_total
                    .with_label_values(&["remote", &pattern])
                    .inc();
            }
            None => {
                self.metrics.lock().misses += 1;
                self.registry
                    .cache_misses_total
                    .with_label_values(&["remote", &pattern])
                    .inc();
            }
        }
        Ok(())
    }

    fn encode(&self, value: &str) -> Result<String> {
        if self.config.compression_enabled {
            self.codec.compress(value)
        } else {
            Ok(value.to_string())
        }
    }

    fn decode(&self, raw: &str) -> Result<String> {
        if self.config.compression_enabled {
            self.codec.decompress(raw)
        } else {
            Ok(raw.to_string())
        }
    }

    fn observe_duration(&self, operation: &str, tier: &str, start: Instant) {
        self.registry
            .cache_operation_duration_seconds
            .with_label_values(&[operation, tier])
            .observe(start.elapsed().as_secs_f64());
    }

    /// Periodically sweeps the local tier.
    fn spawn_eviction_loop(&self) {
        let Some(local) = self.local.clone() else {
            return;
        };
        let interval = self.config.eviction_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick.
            ticker.tick().await;

            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                local.sweep();
            }
        });
    }

    /// Republishes the local tier size and logs a metrics snapshot.
    fn spawn_metrics_loop(&self) {
        let local = self.local.clone();
        let metrics = self.metrics.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_SNAPSHOT_INTERVAL);
            ticker.tick().await;

            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                if let Some(local) = &local {
                    registry
                        .cache_entries
                        .with_label_values(&["local"])
                        .set(local.len() as i64);
                }
                let snapshot = metrics.lock().clone();
                debug!(
                    "Cache metrics: hits={}, misses={}, local_hits={}",
                    snapshot.hits, snapshot.misses, snapshot.local_hits
                );
            }
        });
    }
}

/// Group a key into a metric label by truncating at its first digit:
/// `user:123:profile` becomes `user:*`. Keys with no digits fold into
/// `unknown` so label cardinality stays bounded.
fn key_pattern(key: &str) -> String {
    match key.find(|c: char| c.is_ascii_digit()) {
        Some(i) => format!("{}*", &key[..i]),
        None => "unknown".to_string(),
    }
}
