//! Prometheus metrics registry for pool and cache instrumentation.
//!
//! The registry is an explicitly constructed object handed to each component
//! at startup and torn down with the process. Nothing here touches the
//! prometheus default registry, so tests can create as many isolated
//! registries as they need.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Query latency buckets (seconds).
const DB_QUERY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Cache operation latency buckets (seconds). Cache ops are expected to be an
/// order of magnitude faster than queries.
const CACHE_OP_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1];

/// Container for all Stratum metric families, backed by its own registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,

    /// Open connections in the write group (gauge).
    pub db_connections_active: IntGauge,

    /// Idle connections in the write group (gauge).
    pub db_connections_idle: IntGauge,

    /// Query duration histogram - labels: operation
    pub db_query_duration_seconds: HistogramVec,

    /// Query error counter - labels: operation, error_type
    pub db_query_errors_total: IntCounterVec,

    /// Cache hit counter - labels: tier, key_pattern
    pub cache_hits_total: IntCounterVec,

    /// Cache miss counter - labels: tier, key_pattern
    pub cache_misses_total: IntCounterVec,

    /// Cache operation duration histogram - labels: operation, tier
    pub cache_operation_duration_seconds: HistogramVec,

    /// Live entry count per cache tier (gauge) - labels: tier
    pub cache_entries: IntGaugeVec,
}

impl MetricsRegistry {
    /// Create a registry and register every metric family with it.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let db_connections_active = IntGauge::new(
            "db_connections_active",
            "Number of active database connections",
        )
        .map_err(|e| Error::internal(format!("Failed to create db_connections_active: {}", e)))?;

        let db_connections_idle = IntGauge::new(
            "db_connections_idle",
            "Number of idle database connections",
        )
        .map_err(|e| Error::internal(format!("Failed to create db_connections_idle: {}", e)))?;

        let db_query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "db_query_duration_seconds",
                "Duration of database queries in seconds",
            )
            .buckets(DB_QUERY_BUCKETS.to_vec()),
            &["operation"],
        )
        .map_err(|e| Error::internal(format!("Failed to create db_query_duration_seconds: {}", e)))?;

        let db_query_errors_total = IntCounterVec::new(
            Opts::new(
                "db_query_errors_total",
                "Total number of database query errors",
            ),
            &["operation", "error_type"],
        )
        .map_err(|e| Error::internal(format!("Failed to create db_query_errors_total: {}", e)))?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("cache_hits_total", "Total number of cache hits"),
            &["tier", "key_pattern"],
        )
        .map_err(|e| Error::internal(format!("Failed to create cache_hits_total: {}", e)))?;

        let cache_misses_total = IntCounterVec::new(
            Opts::new("cache_misses_total", "Total number of cache misses"),
            &["tier", "key_pattern"],
        )
        .map_err(|e| Error::internal(format!("Failed to create cache_misses_total: {}", e)))?;

        let cache_operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cache_operation_duration_seconds",
                "Duration of cache operations in seconds",
            )
            .buckets(CACHE_OP_BUCKETS.to_vec()),
            &["operation", "tier"],
        )
        .map_err(|e| {
            Error::internal(format!(
                "Failed to create cache_operation_duration_seconds: {}",
                e
            ))
        })?;

        let cache_entries = IntGaugeVec::new(
            Opts::new("cache_entries", "Current number of live cache entries"),
            &["tier"],
        )
        .map_err(|e| Error::internal(format!("Failed to create cache_entries: {}", e)))?;

        for metric in [
            Box::new(db_connections_active.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(db_connections_idle.clone()),
            Box::new(db_query_duration_seconds.clone()),
            Box::new(db_query_errors_total.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(cache_operation_duration_seconds.clone()),
            Box::new(cache_entries.clone()),
        ] {
            registry
                .register(metric)
                .map_err(|e| Error::internal(format!("Failed to register metric: {}", e)))?;
        }

        Ok(Self {
            registry,
            db_connections_active,
            db_connections_idle,
            db_query_duration_seconds,
            db_query_errors_total,
            cache_hits_total,
            cache_misses_total,
            cache_operation_duration_seconds,
            cache_entries,
        })
    }

    /// Access the underlying registry (for scrape endpoints).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode the current metric state in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| Error::internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buf).map_err(|e| Error::internal(format!("Invalid metrics text: {}", e)))
    }
}
