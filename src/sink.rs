//! Downstream consumers of streamed change records.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::types::ChangeRecord;
use crate::{Error, Result};

/// Receives change records in stream order.
///
/// Returning [`Error::Shutdown`] tells the stream reader that nobody is
/// listening any more; the session then ends gracefully. Any other error is
/// fatal to the session.
#[async_trait]
pub trait RecordSink: Send + 'static {
    async fn emit(&mut self, record: ChangeRecord) -> Result<()>;
}

/// Writes every record to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn emit(&mut self, record: ChangeRecord) -> Result<()> {
        info!(
            lsn = %record.position,
            wal_end = %record.wal_end,
            server_time = %record.server_time,
            "{}",
            record.text()
        );
        Ok(())
    }
}

/// Forwards records into a bounded channel exposed as a `Stream`.
pub struct ChannelSink {
    tx: mpsc::Sender<ChangeRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, ReceiverStream<ChangeRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn emit(&mut self, record: ChangeRecord) -> Result<()> {
        self.tx.send(record).await.map_err(|_| Error::Shutdown)
    }
}
