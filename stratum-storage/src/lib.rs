//! Storage layer for Stratum: pooled SQL access and a tiered key-value cache.
//!
//! This crate provides the two building blocks request handlers talk to:
//!
//! - [`DatabasePool`]: a read/write connection-group manager over the SQL
//!   store, with round-robin replica reads, per-operation timeouts, and a
//!   background health-check loop.
//! - [`TieredCache`]: a local-first cache in front of a remote key-value
//!   tier, with TTL-based local expiry and background eviction.
//!
//! Both components record into a shared [`stratum_core::MetricsRegistry`]
//! passed in at construction.

pub mod compression;
pub mod local_cache;
pub mod pool;
pub mod remote;
pub mod tiered;

pub use compression::{Compression, NoopCompression};
pub use local_cache::{LocalCache, SweepStats};
pub use pool::{AnyQuery, DatabasePool, PoolConfig, PoolMetrics, PoolStats};
pub use remote::{InMemoryStats, InMemoryTier, RedisTier, RemoteTier};
pub use tiered::{CacheConfig, CacheMetrics, TieredCache};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compression::{Compression, NoopCompression};
    pub use crate::local_cache::LocalCache;
    pub use crate::pool::{AnyQuery, DatabasePool, PoolConfig, PoolMetrics, PoolStats};
    pub use crate::remote::{InMemoryTier, RedisTier, RemoteTier};
    pub use crate::tiered::{CacheConfig, CacheMetrics, TieredCache};
    pub use stratum_core::{Error, MetricsRegistry, Result};
}
