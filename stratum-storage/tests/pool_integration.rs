//! Integration tests for the database pool against in-memory SQLite.
//!
//! Each `sqlite::memory:` pool gets its own private database. The write
//! group runs with a single connection so statements and queries observe
//! each other; replica groups therefore open as empty databases, which
//! makes read routing directly observable.

use std::sync::Arc;
use std::time::Duration;
use stratum_core::MetricsRegistry;
use stratum_storage::{DatabasePool, PoolConfig};

fn single_connection_config(replica_count: usize) -> PoolConfig {
    PoolConfig {
        max_open: 1,
        max_idle: 1,
        replica_count,
        query_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    }
}

async fn connect(replica_count: usize) -> DatabasePool {
    DatabasePool::connect(
        "sqlite::memory:",
        single_connection_config(replica_count),
        Arc::new(MetricsRegistry::new().unwrap()),
    )
    .await
    .expect("pool should connect")
}

#[tokio::test]
async fn test_execute_and_fetch_roundtrip() {
    let pool = connect(0).await;

    pool.execute(sqlx::query(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    ))
    .await
    .unwrap();

    let result = pool
        .execute(sqlx::query("INSERT INTO users (name) VALUES (?)").bind("alice"))
        .await
        .unwrap();
    assert_eq!(result.rows_affected(), 1);

    pool.execute(sqlx::query("INSERT INTO users (name) VALUES (?)").bind("bob"))
        .await
        .unwrap();

    // No replicas opened, so reads run on the write group and see the
    // inserts.
    let rows = pool
        .fetch_all(sqlx::query("SELECT name FROM users ORDER BY id"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let row = pool
        .fetch_optional(sqlx::query("SELECT name FROM users WHERE name = ?").bind("alice"))
        .await
        .unwrap();
    assert!(row.is_some());

    let missing = pool
        .fetch_optional(sqlx::query("SELECT name FROM users WHERE name = ?").bind("carol"))
        .await
        .unwrap();
    assert!(missing.is_none());

    let metrics = pool.metrics();
    assert_eq!(metrics.queries_executed, 6);
    assert_eq!(metrics.queries_succeeded, 6);
    assert_eq!(metrics.queries_failed, 0);
    assert_eq!(metrics.reads_on_replicas, 0);
    assert!(metrics.avg_query_time > Duration::ZERO);

    pool.close().await;
}

#[tokio::test]
async fn test_reads_route_to_replicas() {
    let pool = connect(2).await;
    assert_eq!(pool.replica_len(), 2);

    // Reads that need no tables succeed on the empty replica databases.
    for _ in 0..4 {
        let rows = pool.fetch_all(sqlx::query("SELECT 1")).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
    assert_eq!(pool.metrics().reads_on_replicas, 4);

    // A table created through the write group does not exist in the
    // replica databases, so a read against it fails: proof the read was
    // not served by the write group.
    pool.execute(sqlx::query("CREATE TABLE t (a INTEGER)"))
        .await
        .unwrap();
    let err = pool
        .fetch_all(sqlx::query("SELECT a FROM t"))
        .await
        .err()
        .expect("replica read of a write-group table should fail");
    assert!(err.is_database());

    pool.close().await;
}

#[tokio::test]
async fn test_unreachable_replicas_degrade_to_write_group() {
    let config = PoolConfig {
        max_open: 1,
        max_idle: 1,
        replica_count: 2,
        replica_dsns: vec![
            "postgres://nobody@127.0.0.1:1/missing".to_string(),
            "postgres://nobody@127.0.0.1:1/missing".to_string(),
        ],
        query_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let pool = DatabasePool::connect(
        "sqlite::memory:",
        config,
        Arc::new(MetricsRegistry::new().unwrap()),
    )
    .await
    .expect("write group alone should be enough");

    // Both replicas failed to open, so reads run on the write group.
    assert_eq!(pool.replica_len(), 0);

    pool.execute(sqlx::query("CREATE TABLE t (a INTEGER)"))
        .await
        .unwrap();
    pool.execute(sqlx::query("INSERT INTO t (a) VALUES (1)"))
        .await
        .unwrap();
    let rows = pool.fetch_all(sqlx::query("SELECT a FROM t")).await.unwrap();
    assert_eq!(rows.len(), 1);

    assert_eq!(pool.metrics().reads_on_replicas, 0);

    pool.close().await;
}

#[tokio::test]
async fn test_transaction_commit() {
    let pool = connect(0).await;

    pool.execute(sqlx::query("CREATE TABLE t (a INTEGER)"))
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO t (a) VALUES (1)")
        .execute(&mut *tx)
        .await
        .unwrap();
    sqlx::query("INSERT INTO t (a) VALUES (2)")
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rows = pool.fetch_all(sqlx::query("SELECT a FROM t")).await.unwrap();
    assert_eq!(rows.len(), 2);

    pool.close().await;
}

#[tokio::test]
async fn test_transaction_rollback_on_drop() {
    let pool = connect(0).await;

    pool.execute(sqlx::query("CREATE TABLE t (a INTEGER)"))
        .await
        .unwrap();

    {
        let mut tx = pool.begin().await.unwrap();
        sqlx::query("INSERT INTO t (a) VALUES (1)")
            .execute(&mut *tx)
            .await
            .unwrap();
        // Dropped without commit.
    }

    let rows = pool.fetch_all(sqlx::query("SELECT a FROM t")).await.unwrap();
    assert!(rows.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn test_ping_and_stats() {
    let pool = connect(0).await;

    pool.ping().await.unwrap();

    let stats = pool.stats();
    assert!(stats.size >= 1);
    assert_eq!(stats.in_use as usize + stats.idle, stats.size as usize);

    pool.close().await;
}

#[tokio::test]
async fn test_close_rejects_further_queries() {
    let pool = connect(1).await;
    pool.close().await;

    let metrics = pool.metrics();
    assert_eq!(metrics.connections_closed, 2);

    assert!(pool.execute(sqlx::query("SELECT 1")).await.is_err());
}

#[tokio::test]
async fn test_connect_fails_on_unreachable_store() {
    let result = DatabasePool::connect(
        "postgres://nobody@127.0.0.1:1/missing",
        PoolConfig {
            query_timeout: Duration::from_secs(2),
            replica_count: 0,
            ..single_connection_config(0)
        },
        Arc::new(MetricsRegistry::new().unwrap()),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_query_errors_are_counted() {
    let registry = Arc::new(MetricsRegistry::new().unwrap());
    let pool = DatabasePool::connect(
        "sqlite::memory:",
        single_connection_config(0),
        registry.clone(),
    )
    .await
    .unwrap();

    let err = pool
        .execute(sqlx::query("INSERT INTO missing_table (a) VALUES (1)"))
        .await
        .unwrap_err();
    assert!(err.is_database());

    let metrics = pool.metrics();
    assert_eq!(metrics.queries_failed, 1);

    let text = registry.encode_text().unwrap();
    assert!(text.contains("db_query_errors_total"));

    pool.close().await;
}
