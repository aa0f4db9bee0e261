//! Error types for the Stratum system.

/// Result type alias for Stratum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Stratum system.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(String),

    /// Remote cache tier errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Requested key is not present in any cache tier.
    ///
    /// This is a sentinel, not an infrastructure failure: callers branch on
    /// it with [`Error::is_cache_miss`] instead of string-matching.
    #[error("cache miss")]
    CacheMiss,

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Wrapped anyhow errors for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new cache error
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a cache miss
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss)
    }

    /// Check if this is a database error
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Short label for the error class, used as a metrics label value.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Cache(_) => "cache",
            Self::CacheMiss => "miss",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_miss_is_distinguishable() {
        let err = Error::CacheMiss;
        assert!(err.is_cache_miss());
        assert!(!Error::cache("connection refused").is_cache_miss());
    }

    #[test]
    fn decode_error_is_not_a_miss() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(!err.is_cache_miss());
        assert_eq!(err.kind_label(), "serialization");
    }

    #[test]
    fn constructors_map_to_variants() {
        assert!(Error::database("down").is_database());
        assert!(Error::timeout("query").is_timeout());
        assert_eq!(Error::config("bad").kind_label(), "config");
    }
}
