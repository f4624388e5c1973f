mod common;

use common::{get_test_postgres_config, get_test_replication_config};
use pg_logical_stream::{
    ChannelSink, Error, Lsn, PgSource, ReplicationSource, ReplicationStream, Replicator,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};
use tokio_stream::StreamExt;
use tracing::info;

async fn connect_client() -> Client {
    let config = get_test_postgres_config();
    let conn_str = format!(
        "host={} port={} user={} password={} dbname={}",
        config.host, config.port, config.username, config.password, config.database
    );
    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
        .await
        .expect("Failed to connect to PostgreSQL");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("PostgreSQL connection error: {}", e);
        }
    });

    client
}

/// `(confirmed_flush_lsn, restart_lsn)` of a slot.
async fn slot_positions(client: &Client, slot: &str) -> (Lsn, Lsn) {
    let row = client
        .query_one(
            "SELECT confirmed_flush_lsn::text, restart_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await
        .unwrap();
    let confirmed: String = row.get(0);
    let restart: String = row.get(1);
    (confirmed.parse().unwrap(), restart.parse().unwrap())
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let mut config = get_test_postgres_config();
    config.host = "127.0.0.1".to_string();
    config.port = 1;
    config.connect_timeout_secs = 2;
    let source = PgSource::new(config);

    let err = source.slot_exists("t1").await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {}", err);

    let err = source.create_slot("t1", "test_decoding").await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {}", err);
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored postgres_test::test_slot_lifecycle
async fn test_slot_lifecycle() {
    let source = PgSource::new(get_test_postgres_config());
    let slot = get_test_replication_config("lifecycle").slot_name;

    assert!(!source.slot_exists(&slot).await.unwrap());

    let start = source.create_slot(&slot, "test_decoding").await.unwrap();
    info!("Slot {} created at {}", slot, start);
    assert!(!start.is_zero());
    assert!(source.slot_exists(&slot).await.unwrap());

    let client = connect_client().await;
    let positions = slot_positions(&client, &slot).await;
    assert_eq!(positions.0, start);

    let duplicate = source.create_slot(&slot, "test_decoding").await;
    assert!(matches!(duplicate, Err(Error::SlotCreation { .. })));
    assert_eq!(slot_positions(&client, &slot).await, positions);

    source.drop_slot(&slot).await.unwrap();
    assert!(!source.slot_exists(&slot).await.unwrap());

    let missing = source.drop_slot(&slot).await;
    assert!(matches!(missing, Err(Error::SlotNotFound(_))));
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored postgres_test::test_unknown_plugin
async fn test_unknown_plugin() {
    let source = PgSource::new(get_test_postgres_config());
    let slot = get_test_replication_config("unknown_plugin").slot_name;

    let result = source.create_slot(&slot, "no_such_plugin").await;
    assert!(matches!(result, Err(Error::SlotCreation { .. })));
    assert!(!source.slot_exists(&slot).await.unwrap());
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored postgres_test::test_idle_stream_acknowledges
async fn test_idle_stream_acknowledges() {
    let source = PgSource::new(get_test_postgres_config());
    let slot = get_test_replication_config("idle").slot_name;
    let start = source.create_slot(&slot, "test_decoding").await.unwrap();

    let mut stream = source
        .start_replication(&slot, start, &BTreeMap::new())
        .await
        .unwrap();

    for _ in 0..10 {
        stream.fetch_next(Duration::from_millis(100)).await.unwrap();
    }
    stream.flush(start).await.unwrap();
    stream.close().await.unwrap();

    source.drop_slot(&slot).await.unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --ignored postgres_test::test_stream_changes
async fn test_stream_changes() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_logical_stream=debug")
        .try_init()
        .ok();

    let client = connect_client().await;
    let table = format!("stream_test_{}", std::process::id());
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} (id serial PRIMARY KEY, name text)"
        ))
        .await
        .unwrap();

    let source = PgSource::new(get_test_postgres_config());
    let config = get_test_replication_config("stream");
    let slot = config.slot_name.clone();
    let mut replicator = Replicator::new(source, config);

    let (sink, mut records) = ChannelSink::new(256);
    let start = replicator.start(sink).await.unwrap();
    info!("Streaming from {}", start);

    client
        .execute(&format!("INSERT INTO {table} (name) VALUES ($1)"), &[&"Alice"])
        .await
        .unwrap();

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_secs(1), records.next()).await {
            Ok(Some(record)) => {
                let text = record.text().into_owned();
                seen.push(text.clone());
                if text.starts_with("COMMIT") {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }

    assert!(seen.iter().any(|line| line.starts_with("BEGIN")), "{:?}", seen);
    assert!(seen.iter().any(|line| line.contains("INSERT") && line.contains("Alice")), "{:?}", seen);
    assert!(seen.iter().any(|line| line.starts_with("COMMIT")), "{:?}", seen);

    let summary = replicator.stop().await.unwrap();
    assert!(summary.records >= 3);
    assert!(summary.flushed >= start);

    let exists: i64 = client
        .query_one(
            "SELECT count(*) FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(exists, 0);

    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {table}"))
        .await
        .unwrap();
}
