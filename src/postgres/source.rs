use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::config::SslMode;
use tokio_postgres::NoTls;
use tracing::{debug, error, warn};

use super::connection::ReplicationConnection;
use super::protocol::CopyBothMessage;
use super::slot;
use crate::config::PostgresConfig;
use crate::lsn::Lsn;
use crate::source::{ReplicationSource, ReplicationStream};
use crate::types::FetchStatus;
use crate::{Error, Result};

/// PostgreSQL as a replication source.
///
/// Every operation opens its own connection and closes it before returning;
/// only [`PgStream`] keeps one open.
#[derive(Debug, Clone)]
pub struct PgSource {
    config: PostgresConfig,
}

impl PgSource {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    async fn control_client(&self) -> Result<tokio_postgres::Client> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.config.host)
            .port(self.config.port)
            .user(&self.config.username)
            .password(&self.config.password)
            .dbname(&self.config.database)
            .application_name(&self.config.application_name)
            .ssl_mode(SslMode::Disable)
            .connect_timeout(self.config.connect_timeout());

        let (client, connection) = config.connect(NoTls).await.map_err(Error::connection)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Control connection error");
            }
        });

        Ok(client)
    }
}

async fn close_quietly(connection: &mut ReplicationConnection) {
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close replication connection");
    }
}

#[async_trait]
impl ReplicationSource for PgSource {
    type Stream = PgStream;

    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let client = self.control_client().await?;
        slot::slot_exists(&client, slot_name).await
    }

    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<Lsn> {
        let mut connection = ReplicationConnection::connect(&self.config).await?;
        let result = slot::create_slot(&mut connection, slot_name, plugin).await;
        close_quietly(&mut connection).await;
        result
    }

    async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        let mut connection = ReplicationConnection::connect(&self.config).await?;
        let result = slot::drop_slot(&mut connection, slot_name).await;
        close_quietly(&mut connection).await;
        result
    }

    async fn start_replication(
        &self,
        slot_name: &str,
        start: Lsn,
        plugin_options: &BTreeMap<String, String>,
    ) -> Result<PgStream> {
        slot::validate_slot_name(slot_name)?;

        let mut connection = ReplicationConnection::connect(&self.config).await?;
        let command = slot::start_replication_command(slot_name, start, plugin_options);

        if let Err(e) = connection.start_replication(&command).await {
            close_quietly(&mut connection).await;
            return Err(slot::classify_start_error(slot_name, e));
        }

        Ok(PgStream {
            connection,
            flushed: start,
        })
    }
}

/// An open walsender stream in CopyBoth mode.
pub struct PgStream {
    connection: ReplicationConnection,
    flushed: Lsn,
}

#[async_trait]
impl ReplicationStream for PgStream {
    async fn fetch_next(&mut self, timeout: Duration) -> Result<FetchStatus> {
        let message = match tokio::time::timeout(timeout, self.connection.recv()).await {
            Ok(message) => message?,
            Err(_) => return Ok(FetchStatus::NoData),
        };

        match message {
            None => Ok(FetchStatus::End),
            Some(CopyBothMessage::Keepalive { wal_end, reply, .. }) => {
                debug!(wal_end = %wal_end, reply, "Keepalive");
                if reply {
                    self.connection
                        .send_status_update(self.flushed, false)
                        .await?;
                }
                Ok(FetchStatus::NoData)
            }
            Some(message) => Ok(message
                .into_record()
                .map(FetchStatus::Data)
                .unwrap_or(FetchStatus::NoData)),
        }
    }

    async fn flush(&mut self, position: Lsn) -> Result<()> {
        self.connection.send_status_update(position, false).await?;
        self.flushed = position;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connection.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::test_utils::{
        copy_both_response, keepalive, read_frontend, xlog_data, FakeServer,
    };
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_lost_control_connection_is_a_connection_error() {
        let server = FakeServer::bind().await;
        let source = PgSource::new(server.config());

        let postgres = tokio::spawn(async move {
            let mut socket = server.accept().await;
            read_frontend(&mut socket).await;
        });

        let err = source.slot_exists("t1").await.unwrap_err();
        assert!(err.is_connection(), "expected connection error, got {:?}", err);
        postgres.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_answers_keepalive_with_flushed_position() {
        let server = FakeServer::bind().await;
        let source = PgSource::new(server.config());

        let walsender = tokio::spawn(async move {
            let mut socket = server.accept().await;
            let (tag, _) = read_frontend(&mut socket).await;
            assert_eq!(tag, b'Q');

            let mut reply = copy_both_response();
            reply.extend(keepalive(0x1800, true));
            socket.write_all(&reply).await.unwrap();

            let (tag, body) = read_frontend(&mut socket).await;
            assert_eq!(tag, b'd');
            assert_eq!(body[0], b'r');
            assert_eq!(&body[1..9], &0x1000u64.to_be_bytes());

            socket
                .write_all(&xlog_data(0x1800, 0x1900, b"COMMIT 7"))
                .await
                .unwrap();

            assert_eq!(read_frontend(&mut socket).await.0, b'c');
            assert_eq!(read_frontend(&mut socket).await.0, b'X');
        });

        let mut stream = source
            .start_replication("t1", Lsn(0x1000), &BTreeMap::new())
            .await
            .unwrap();
        let timeout = Duration::from_secs(5);

        assert_eq!(stream.fetch_next(timeout).await.unwrap(), FetchStatus::NoData);
        match stream.fetch_next(timeout).await.unwrap() {
            FetchStatus::Data(record) => {
                assert_eq!(record.position, Lsn(0x1800));
                assert_eq!(&record.data[..], b"COMMIT 7");
            }
            other => panic!("expected a record, got {:?}", other),
        }

        stream.close().await.unwrap();
        walsender.await.unwrap();
    }
}
