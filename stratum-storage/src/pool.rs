//! Connection pool manager for the relational store.
//!
//! Owns one write-capable connection group and zero or more read-only
//! replica groups, all opened from DSN strings through sqlx's `Any` driver.
//! Reads are load-balanced across replicas with a dedicated round-robin
//! counter; writes and transactions always go through the write group.
//! Every operation is bounded by the configured query timeout and recorded
//! in both the pool's own metrics and the shared registry.

use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::{AnyPool, Connection, Execute};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_core::error::{Error, Result};
use stratum_core::MetricsRegistry;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A runtime-bound query against the `Any` driver, as built by
/// [`sqlx::query`] plus `.bind(...)` calls.
pub type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

/// Bounded timeout for the connectivity probe at construction.
const STARTUP_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for each ping issued by the health-check loop and `ping()`.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the gauge-republishing metrics loop.
const METRICS_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection pool configuration. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum open connections in the write group
    pub max_open: u32,
    /// Idle connections kept warm in the write group
    pub max_idle: u32,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// Idle timeout before a connection is closed
    pub max_idle_time: Duration,
    /// Number of read-only replica groups to open
    pub replica_count: usize,
    /// Alternate DSNs for replicas. When shorter than `replica_count`,
    /// remaining replicas reuse the primary DSN.
    pub replica_dsns: Vec<String>,
    /// Interval between background health checks
    pub health_check_interval: Duration,
    /// Deadline applied to each query/exec
    pub query_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 100,
            max_idle: 25,
            max_lifetime: Duration::from_secs(3600),
            max_idle_time: Duration::from_secs(15 * 60),
            replica_count: 2,
            replica_dsns: Vec::new(),
            health_check_interval: Duration::from_secs(5 * 60),
            query_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Validate invariants: at least one connection, idle bound within the
    /// open bound.
    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(Error::config("max_open must be at least 1"));
        }
        if self.max_idle > self.max_open {
            return Err(Error::config(format!(
                "max_idle ({}) must not exceed max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        Ok(())
    }
}

/// Pool performance metrics. Callers receive copies, never live references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub queries_executed: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    /// Running average over all recorded operations
    pub avg_query_time: Duration,
    /// Reads routed to a replica group (zero when running write-group-only)
    pub reads_on_replicas: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

impl PoolMetrics {
    fn record(&mut self, duration: Duration, failed: bool) {
        self.queries_executed += 1;
        if failed {
            self.queries_failed += 1;
        } else {
            self.queries_succeeded += 1;
        }

        let n = self.queries_executed;
        self.avg_query_time = Duration::from_secs_f64(
            (self.avg_query_time.as_secs_f64() * (n - 1) as f64 + duration.as_secs_f64())
                / n as f64,
        );
    }
}

/// Native pool statistics, passed through from the write group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
    pub in_use: u32,
}

/// Read/write connection-group manager over the relational store.
pub struct DatabasePool {
    write: AnyPool,
    replicas: Vec<AnyPool>,
    config: PoolConfig,
    metrics: Arc<parking_lot::Mutex<PoolMetrics>>,
    registry: Arc<MetricsRegistry>,
    read_cursor: AtomicUsize,
    running: Arc<AtomicBool>,
}

impl DatabasePool {
    /// Open the write group, verify connectivity, then open the replica
    /// groups and start the background loops.
    ///
    /// Construction fails only if the write group is unreachable. A replica
    /// that fails to open is logged and left out of the rotation; reads
    /// degrade to the remaining groups (or the write group).
    pub async fn connect(
        dsn: &str,
        config: PoolConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        install_default_drivers();

        let write = open_group(dsn, &config, config.max_open, config.max_idle).await?;
        probe(&write, STARTUP_PING_TIMEOUT)
            .await
            .map_err(|e| Error::database(format!("failed to ping database at startup: {}", e)))?;

        let mut metrics = PoolMetrics {
            connections_opened: 1,
            ..Default::default()
        };

        // Replicas run at half the write group's limits.
        let replica_max = (config.max_open / 2).max(1);
        let replica_idle = (config.max_idle / 2).min(replica_max);

        let mut replicas = Vec::with_capacity(config.replica_count);
        for i in 0..config.replica_count {
            let replica_dsn = config.replica_dsns.get(i).map(String::as_str).unwrap_or(dsn);
            match open_group(replica_dsn, &config, replica_max, replica_idle).await {
                Ok(pool) => {
                    metrics.connections_opened += 1;
                    replicas.push(pool);
                }
                Err(e) => {
                    warn!("Failed to open read replica {}: {}", i, e);
                }
            }
        }

        info!(
            "Database pool initialized: max_open={}, replicas={}/{}",
            config.max_open,
            replicas.len(),
            config.replica_count
        );

        let pool = Self {
            write,
            replicas,
            config,
            metrics: Arc::new(parking_lot::Mutex::new(metrics)),
            registry,
            read_cursor: AtomicUsize::new(0),
            running: Arc::new(AtomicBool::new(true)),
        };

        pool.spawn_health_check_loop();
        pool.spawn_metrics_loop();

        Ok(pool)
    }

    /// Execute a read query, round-robined across replica groups.
    pub async fn fetch_all(&self, query: AnyQuery<'_>) -> Result<Vec<AnyRow>> {
        let pool = self.read_pool();
        let start = Instant::now();
        let result = self
            .with_deadline(self.config.query_timeout, "query", query.fetch_all(pool))
            .await;
        self.record_query("select", start.elapsed(), result.as_ref().err());
        result
    }

    /// Single-row convenience form of [`fetch_all`](Self::fetch_all): same
    /// routing and timeout policy, `None` when no row matched.
    pub async fn fetch_optional(&self, query: AnyQuery<'_>) -> Result<Option<AnyRow>> {
        let pool = self.read_pool();
        let start = Instant::now();
        let result = self
            .with_deadline(
                self.config.query_timeout,
                "query",
                query.fetch_optional(pool),
            )
            .await;
        self.record_query("select", start.elapsed(), result.as_ref().err());
        result
    }

    /// Execute a write statement. Always routed to the write group.
    pub async fn execute(&self, query: AnyQuery<'_>) -> Result<AnyQueryResult> {
        let operation = statement_kind(query.sql());
        let start = Instant::now();
        let result = self
            .with_deadline(
                self.config.query_timeout,
                "exec",
                query.execute(&self.write),
            )
            .await;
        self.record_query(operation, start.elapsed(), result.as_ref().err());
        result
    }

    /// Begin a transaction on the write group. Transactions span multiple
    /// statements, so the deadline is twice the query timeout.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Any>> {
        self.with_deadline(
            self.config.query_timeout * 2,
            "begin transaction",
            self.write.begin(),
        )
        .await
    }

    /// Bounded connectivity probe against the write group.
    pub async fn ping(&self) -> Result<()> {
        probe(&self.write, HEALTH_PROBE_TIMEOUT).await
    }

    /// Native statistics of the write group.
    pub fn stats(&self) -> PoolStats {
        let size = self.write.size();
        let idle = self.write.num_idle();
        PoolStats {
            size,
            idle,
            in_use: size.saturating_sub(idle as u32),
        }
    }

    /// Snapshot of the pool metrics (copy).
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.lock().clone()
    }

    /// Number of replica groups that opened successfully.
    pub fn replica_len(&self) -> usize {
        self.replicas.len()
    }

    /// Stop the background loops and close every connection group.
    pub async fn close(&self) {
        info!("Closing database pool");
        self.running.store(false, Ordering::Relaxed);

        self.write.close().await;
        for replica in &self.replicas {
            replica.close().await;
        }

        let mut m = self.metrics.lock();
        m.connections_closed += 1 + self.replicas.len() as u64;
    }

    /// Select the next read group. Falls back to the write group when no
    /// replica opened.
    fn read_pool(&self) -> &AnyPool {
        if self.replicas.is_empty() {
            return &self.write;
        }
        let index = select_index(&self.read_cursor, self.replicas.len());
        self.metrics.lock().reads_on_replicas += 1;
        &self.replicas[index]
    }

    async fn with_deadline<T>(
        &self,
        limit: Duration,
        what: &str,
        fut: impl Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<T> {
        match timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::database(format!("{} failed: {}", what, e))),
            Err(_) => Err(Error::timeout(format!("{} exceeded {:?}", what, limit))),
        }
    }

    fn record_query(&self, operation: &str, duration: Duration, error: Option<&Error>) {
        self.metrics.lock().record(duration, error.is_some());

        if let Some(e) = error {
            self.registry
                .db_query_errors_total
                .with_label_values(&[operation, e.kind_label()])
                .inc();
        }
        self.registry
            .db_query_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Pings the write group and every replica on an interval. Failures are
    /// logged, never escalated, and never remove a replica from rotation.
    fn spawn_health_check_loop(&self) {
        let write = self.write.clone();
        let replicas = self.replicas.clone();
        let interval = self.config.health_check_interval;
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

                if let Err(e) = probe(&write, HEALTH_PROBE_TIMEOUT).await {
                    warn!("Write group health check failed: {}", e);
                }
                for (i, replica) in replicas.iter().enumerate() {
                    if let Err(e) = probe(replica, HEALTH_PROBE_TIMEOUT).await {
                        warn!("Read replica {} health check failed: {}", i, e);
                    }
                }
                debug!("Pool health check pass complete");
            }
        });
    }

    /// Republishes the write group's native counts as gauges.
    fn spawn_metrics_loop(&self) {
        let write = self.write.clone();
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

                registry.db_connections_active.set(write.size() as i64);
                registry.db_connections_idle.set(write.num_idle() as i64);
            }
        });
    }
}

/// Open one connection group with the given sizing limits.
async fn open_group(
    dsn: &str,
    config: &PoolConfig,
    max_open: u32,
    max_idle: u32,
) -> Result<AnyPool> {
    AnyPoolOptions::new()
        .max_connections(max_open)
        .min_connections(max_idle)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.max_idle_time)
        .acquire_timeout(config.query_timeout)
        .connect(dsn)
        .await
        .map_err(|e| Error::database(format!("failed to open connection group: {}", e)))
}

/// Acquire a connection and ping it within the given deadline.
async fn probe(pool: &AnyPool, limit: Duration) -> Result<()> {
    match timeout(limit, async {
        let mut conn = pool.acquire().await?;
        conn.ping().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::database(format!("ping failed: {}", e))),
        Err(_) => Err(Error::timeout(format!("ping exceeded {:?}", limit))),
    }
}

/// Round-robin selection over `len` groups via a dedicated atomic counter.
/// Wraps through the counter itself, so selection stays fair across
/// concurrent callers collectively.
fn select_index(cursor: &AtomicUsize, len: usize) -> usize {
    cursor.fetch_add(1, Ordering::Relaxed) % len
}

/// Classify a statement by its leading keyword, for metrics tagging.
fn statement_kind(sql: &str) -> &'static str {
    let head = sql.trim_start().split_whitespace().next().unwrap_or("");
    if head.eq_ignore_ascii_case("insert") {
        "insert"
    } else if head.eq_ignore_ascii_case("update") {
        "update"
    } else if head.eq_ignore_ascii_case("delete") {
        "delete"
    } else if head.eq_ignore_ascii_case("select") {
        "select"
    } else {
        "other"
    }
}
