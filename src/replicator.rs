use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ReplicationConfig;
use crate::lsn::Lsn;
use crate::sink::RecordSink;
use crate::source::ReplicationSource;
use crate::stream::StreamReader;
use crate::types::StreamSummary;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Preparing,
    Streaming,
    Cleanup,
}

struct Session {
    start: Lsn,
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
    handle: JoinHandle<Result<StreamSummary>>,
    /// Task result, kept once joined so an interrupted `stop` can resume.
    joined: Option<Result<StreamSummary>>,
}

/// Owns one replication slot for the duration of a streaming session.
///
/// `start` replaces any stale slot of the configured name with a fresh one and
/// streams from it on a background task. `stop` cancels that task, waits for
/// it to release the stream and then drops the slot. Dropping a streaming
/// `Replicator` inside a runtime does the same on a background task.
pub struct Replicator<S: ReplicationSource> {
    source: Arc<S>,
    config: ReplicationConfig,
    state: ReplicatorState,
    session: Option<Session>,
}

impl<S: ReplicationSource> Replicator<S> {
    pub fn new(source: S, config: ReplicationConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            state: ReplicatorState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    pub fn slot_name(&self) -> &str {
        &self.config.slot_name
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Position the current session started from, if streaming.
    pub fn start_position(&self) -> Option<Lsn> {
        self.session.as_ref().map(|session| session.start)
    }

    /// Prepares a fresh slot and starts streaming it into `sink`.
    ///
    /// Returns the start position as soon as the background task is running.
    /// On failure the controller is back in `Idle` and any slot this call
    /// created has been dropped.
    pub async fn start<K: RecordSink>(&mut self, sink: K) -> Result<Lsn> {
        if self.state != ReplicatorState::Idle {
            return Err(Error::Lifecycle(format!(
                "cannot start replication while {:?}",
                self.state
            )));
        }

        self.config.validate()?;
        self.state = ReplicatorState::Preparing;

        match self.prepare(sink).await {
            Ok(session) => {
                let start = session.start;
                self.session = Some(session);
                self.state = ReplicatorState::Streaming;
                info!(slot = %self.config.slot_name, start = %start, "Replication started");
                Ok(start)
            }
            Err(e) => {
                self.state = ReplicatorState::Idle;
                error!(slot = %self.config.slot_name, error = %e, "Failed to start replication");
                Err(e)
            }
        }
    }

    async fn prepare<K: RecordSink>(&self, sink: K) -> Result<Session> {
        let slot_name = &self.config.slot_name;

        if self.source.slot_exists(slot_name).await? {
            warn!(slot = %slot_name, "Dropping stale replication slot");
            match self.source.drop_slot(slot_name).await {
                Ok(()) | Err(Error::SlotNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let start = self
            .source
            .create_slot(slot_name, &self.config.plugin)
            .await?;

        let reader = match StreamReader::open(self.source.as_ref(), &self.config, start).await {
            Ok(reader) => reader,
            Err(e) => {
                if let Err(drop_err) = self.source.drop_slot(slot_name).await {
                    warn!(slot = %slot_name, error = %drop_err, "Failed to drop slot after start failure");
                }
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let result = reader.run(sink, cancel_rx).await;
            let _ = finished_tx.send(true);
            result
        });

        Ok(Session {
            start,
            cancel: cancel_tx,
            finished: finished_rx,
            handle,
            joined: None,
        })
    }

    /// Cancels streaming, waits for the background task and drops the slot.
    ///
    /// The slot is dropped even when the stream failed. A stream error is
    /// returned in preference to a failure dropping the slot. If the returned
    /// future is dropped part way, the controller stays in `Cleanup` and
    /// calling `stop` again finishes the job.
    pub async fn stop(&mut self) -> Result<StreamSummary> {
        if !matches!(
            self.state,
            ReplicatorState::Streaming | ReplicatorState::Cleanup
        ) {
            return Err(Error::Lifecycle(format!(
                "cannot stop replication while {:?}",
                self.state
            )));
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("streaming without a session".to_string()))?;

        if self.state == ReplicatorState::Streaming {
            self.state = ReplicatorState::Cleanup;
            info!(slot = %self.config.slot_name, "Stopping replication");
        }

        let _ = session.cancel.send(true);
        if session.joined.is_none() {
            let result = match (&mut session.handle).await {
                Ok(result) => result,
                Err(e) => Err(Error::Task(e.to_string())),
            };
            session.joined = Some(result);
        }

        let drop_result = self.source.drop_slot(&self.config.slot_name).await;
        let stream_result = self
            .session
            .take()
            .and_then(|session| session.joined)
            .unwrap_or_else(|| Err(Error::Lifecycle("session lost during stop".to_string())));
        self.state = ReplicatorState::Idle;

        match (stream_result, drop_result) {
            (Ok(summary), Ok(())) => {
                info!(
                    slot = %self.config.slot_name,
                    flushed = %summary.flushed,
                    records = summary.records,
                    "Replication stopped"
                );
                Ok(summary)
            }
            (Ok(_), Err(e)) => {
                error!(slot = %self.config.slot_name, error = %e, "Failed to drop replication slot");
                Err(e)
            }
            (Err(e), drop_result) => {
                if let Err(drop_err) = drop_result {
                    error!(slot = %self.config.slot_name, error = %drop_err, "Failed to drop replication slot");
                }
                error!(slot = %self.config.slot_name, error = %e, "Replication stream failed");
                Err(e)
            }
        }
    }

    /// Resolves once the streaming task has exited, or immediately when not
    /// streaming.
    pub async fn stream_finished(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let mut finished = session.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl<S: ReplicationSource> Drop for Replicator<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = session.cancel.send(true);
        let slot_name = self.config.slot_name.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                slot = %slot_name,
                "Replicator dropped outside a runtime, replication slot was not removed"
            );
            return;
        };

        warn!(slot = %slot_name, "Replicator dropped while streaming, removing slot in the background");
        let source = Arc::clone(&self.source);
        runtime.spawn(async move {
            if session.joined.is_none() {
                if let Err(e) = session.handle.await {
                    warn!(slot = %slot_name, error = %e, "Streaming task did not exit cleanly");
                }
            }
            match source.drop_slot(&slot_name).await {
                Ok(()) | Err(Error::SlotNotFound(_)) => {
                    info!(slot = %slot_name, "Replication slot removed after drop");
                }
                Err(e) => {
                    error!(slot = %slot_name, error = %e, "Failed to drop replication slot after drop");
                }
            }
        });
    }
}
