use pg_logical_stream::config::{PostgresConfig, ReplicationConfig};
use std::env;

/// Get test configuration from environment variables
pub fn get_test_postgres_config() -> PostgresConfig {
    // Use TEST_ prefix for test environment variables
    PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
        application_name: "pg-logical-stream-tests".to_string(),
    }
}

/// Slot settings unique to this test process
pub fn get_test_replication_config(prefix: &str) -> ReplicationConfig {
    let mut config = ReplicationConfig::new(format!("{}_{}", prefix, std::process::id()));
    config.flush_interval_ms = 200; // Frequent flushes for tests
    config
}
