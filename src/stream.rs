//! The poll loop that pulls records from an open replication stream.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReplicationConfig;
use crate::lsn::Lsn;
use crate::sink::RecordSink;
use crate::source::{ReplicationSource, ReplicationStream};
use crate::types::{FetchStatus, StreamSummary};
use crate::{Error, Result};

/// Reads one replication stream until it is cancelled, ends, or fails.
///
/// Records reach the sink in source order. The position confirmed to the
/// source never goes backwards and never passes a record the sink has not
/// accepted.
pub struct StreamReader<T> {
    stream: T,
    slot_name: String,
    start: Lsn,
    flush_interval: Duration,
    poll_interval: Duration,
    poll_timeout: Duration,
}

struct Session {
    cursor: Lsn,
    flushed: Lsn,
    last_flush: Instant,
    records: u64,
}

impl<T: ReplicationStream> StreamReader<T> {
    /// Opens a stream on the configured slot starting at `start`.
    pub async fn open<S>(source: &S, config: &ReplicationConfig, start: Lsn) -> Result<Self>
    where
        S: ReplicationSource<Stream = T>,
    {
        info!(
            slot = %config.slot_name,
            plugin = %config.plugin,
            start = %start,
            "Opening replication stream"
        );

        let stream = source
            .start_replication(&config.slot_name, start, &config.plugin_options)
            .await?;

        Ok(Self {
            stream,
            slot_name: config.slot_name.clone(),
            start,
            flush_interval: config.flush_interval(),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        })
    }

    pub fn start(&self) -> Lsn {
        self.start
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// Streams into `sink` until `cancel` is set or its sender goes away, the
    /// source ends the stream, or the sink stops listening.
    ///
    /// The stream is closed on every exit path.
    pub async fn run<K: RecordSink>(
        mut self,
        mut sink: K,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<StreamSummary> {
        info!(slot = %self.slot_name, start = %self.start, "Replication stream started");

        let mut session = Session {
            cursor: self.start,
            flushed: self.start,
            last_flush: Instant::now(),
            records: 0,
        };

        let mut result = self.poll_loop(&mut sink, &mut cancel, &mut session).await;

        if result.is_ok() && session.cursor > session.flushed {
            result = self.flush(&mut session).await;
        }

        if let Err(e) = self.stream.close().await {
            warn!(slot = %self.slot_name, error = %e, "Failed to close replication stream");
        }

        let summary = StreamSummary {
            start: self.start,
            flushed: session.flushed,
            records: session.records,
        };

        match result {
            Ok(()) => {
                info!(
                    slot = %self.slot_name,
                    flushed = %summary.flushed,
                    records = summary.records,
                    "Replication stream stopped"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(
                    slot = %self.slot_name,
                    flushed = %summary.flushed,
                    records = summary.records,
                    error = %e,
                    "Replication stream failed"
                );
                Err(e)
            }
        }
    }

    async fn poll_loop<K: RecordSink>(
        &mut self,
        sink: &mut K,
        cancel: &mut watch::Receiver<bool>,
        session: &mut Session,
    ) -> Result<()> {
        loop {
            match self.stream.fetch_next(self.poll_timeout).await? {
                FetchStatus::Data(record) => {
                    let position = record.position;
                    let emitted = tokio::select! {
                        biased;
                        result = sink.emit(record) => result,
                        _ = cancelled(cancel) => {
                            info!(slot = %self.slot_name, "Cancelled while waiting on the sink");
                            return Ok(());
                        }
                    };
                    match emitted {
                        Ok(()) => {
                            session.cursor = session.cursor.max(position);
                            session.records += 1;
                        }
                        Err(Error::Shutdown) => {
                            info!(slot = %self.slot_name, "Downstream closed, stopping stream");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                FetchStatus::NoData => {}
                FetchStatus::End => {
                    info!(slot = %self.slot_name, "Source ended the replication stream");
                    return Ok(());
                }
            }

            if session.last_flush.elapsed() >= self.flush_interval {
                self.flush(session).await?;
            }

            tokio::time::sleep(self.poll_interval).await;

            if cancellation_requested(cancel) {
                info!(slot = %self.slot_name, "Cancellation requested, stopping stream");
                return Ok(());
            }
        }
    }

    async fn flush(&mut self, session: &mut Session) -> Result<()> {
        let position = session.cursor.max(session.flushed);
        self.stream.flush(position).await?;
        debug!(slot = %self.slot_name, lsn = %position, "Flushed");
        session.flushed = position;
        session.last_flush = Instant::now();
        Ok(())
    }
}

/// True once cancellation is set or the controlling sender is gone.
fn cancellation_requested(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Resolves under the same conditions as [`cancellation_requested`].
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|requested| *requested).await;
}
