//! In-process replication source.
//!
//! Mirrors the slot rules PostgreSQL enforces (unique slot names, known output
//! plugins, one active stream per slot, no dropping an active slot) without a
//! server. Records are appended to a shared log with [`MemorySource::append`]
//! and handed to every stream reading past their position.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::OBJECT_IN_USE;
use crate::lsn::Lsn;
use crate::postgres::slot::{validate_plugin_name, validate_slot_name};
use crate::source::{ReplicationSource, ReplicationStream};
use crate::types::{ChangeRecord, FetchStatus};
use crate::{Error, Result};

const INITIAL_LSN: u64 = 0x0100_0000;
const RECORD_HEADER_LEN: u64 = 24;

#[derive(Debug, Clone)]
struct SlotState {
    plugin: String,
    start: Lsn,
    confirmed: Lsn,
    flushes: Vec<Lsn>,
    active: bool,
}

#[derive(Debug, Clone)]
struct WalEntry {
    position: Lsn,
    data: Bytes,
}

#[derive(Debug)]
struct State {
    reachable: bool,
    ended: bool,
    next_lsn: u64,
    plugins: BTreeSet<String>,
    slots: BTreeMap<String, SlotState>,
    wal: Vec<WalEntry>,
}

impl State {
    fn check_reachable(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(Error::Connection("source is unreachable".to_string()))
        }
    }
}

/// A replication source held entirely in memory.
///
/// Clones share the same log and slots.
#[derive(Debug, Clone)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    /// Creates a source that knows the `test_decoding`, `pgoutput` and
    /// `wal2json` plugins.
    pub fn new() -> Self {
        Self::with_plugins(["test_decoding", "pgoutput", "wal2json"])
    }

    pub fn with_plugins<I, P>(plugins: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                ended: false,
                next_lsn: INITIAL_LSN,
                plugins: plugins.into_iter().map(Into::into).collect(),
                slots: BTreeMap::new(),
                wal: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a record to the log and returns its position.
    pub fn append(&self, data: impl Into<Bytes>) -> Lsn {
        let data = data.into();
        let position = {
            let mut state = self.lock();
            let position = Lsn(state.next_lsn);
            state.next_lsn += RECORD_HEADER_LEN + data.len() as u64;
            state.wal.push(WalEntry { position, data });
            position
        };
        self.notify.notify_waiters();
        position
    }

    /// Ends every stream once it has read the whole log.
    pub fn finish(&self) {
        self.lock().ended = true;
        self.notify.notify_waiters();
    }

    /// An unreachable source fails every operation with a connection error,
    /// including polls on streams that are already open.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
        self.notify.notify_waiters();
    }

    /// Every position confirmed on `slot_name`, in the order received.
    pub fn flushes(&self, slot_name: &str) -> Vec<Lsn> {
        self.lock()
            .slots
            .get(slot_name)
            .map(|slot| slot.flushes.clone())
            .unwrap_or_default()
    }

    pub fn slot_start(&self, slot_name: &str) -> Option<Lsn> {
        self.lock().slots.get(slot_name).map(|slot| slot.start)
    }

    pub fn slot_plugin(&self, slot_name: &str) -> Option<String> {
        self.lock()
            .slots
            .get(slot_name)
            .map(|slot| slot.plugin.clone())
    }

    pub fn confirmed_position(&self, slot_name: &str) -> Option<Lsn> {
        self.lock().slots.get(slot_name).map(|slot| slot.confirmed)
    }

    /// Whether a stream is currently open on the slot.
    pub fn is_active(&self, slot_name: &str) -> bool {
        self.lock()
            .slots
            .get(slot_name)
            .map(|slot| slot.active)
            .unwrap_or(false)
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.lock().slots.keys().cloned().collect()
    }
}

#[async_trait]
impl ReplicationSource for MemorySource {
    type Stream = MemoryStream;

    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let state = self.lock();
        state.check_reachable()?;
        Ok(state.slots.contains_key(slot_name))
    }

    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<Lsn> {
        validate_slot_name(slot_name)?;
        validate_plugin_name(plugin)?;

        let mut state = self.lock();
        state.check_reachable()?;

        if state.slots.contains_key(slot_name) {
            return Err(Error::SlotCreation {
                slot: slot_name.to_string(),
                message: format!("replication slot \"{}\" already exists", slot_name),
            });
        }
        if !state.plugins.contains(plugin) {
            return Err(Error::SlotCreation {
                slot: slot_name.to_string(),
                message: format!("could not access file \"{}\": No such file or directory", plugin),
            });
        }

        let start = Lsn(state.next_lsn);
        state.slots.insert(
            slot_name.to_string(),
            SlotState {
                plugin: plugin.to_string(),
                start,
                confirmed: start,
                flushes: Vec::new(),
                active: false,
            },
        );

        debug!(slot = %slot_name, plugin = %plugin, start = %start, "Created in-memory slot");
        Ok(start)
    }

    async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_reachable()?;

        let active = match state.slots.get(slot_name) {
            Some(slot) => slot.active,
            None => return Err(Error::SlotNotFound(slot_name.to_string())),
        };
        if active {
            return Err(Error::Server {
                code: OBJECT_IN_USE.to_string(),
                message: format!("replication slot \"{}\" is active", slot_name),
            });
        }

        state.slots.remove(slot_name);
        debug!(slot = %slot_name, "Dropped in-memory slot");
        Ok(())
    }

    async fn start_replication(
        &self,
        slot_name: &str,
        start: Lsn,
        _plugin_options: &BTreeMap<String, String>,
    ) -> Result<MemoryStream> {
        let mut state = self.lock();
        state.check_reachable()?;

        let slot = state
            .slots
            .get_mut(slot_name)
            .ok_or_else(|| Error::SlotNotFound(slot_name.to_string()))?;
        if slot.active {
            return Err(Error::Server {
                code: OBJECT_IN_USE.to_string(),
                message: format!("replication slot \"{}\" is active", slot_name),
            });
        }
        slot.active = true;

        let from = start.max(slot.start);
        let next_index = state.wal.partition_point(|entry| entry.position < from);

        Ok(MemoryStream {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            slot_name: slot_name.to_string(),
            next_index,
            closed: false,
        })
    }
}

/// A stream over the log of a [`MemorySource`].
#[derive(Debug)]
pub struct MemoryStream {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    slot_name: String,
    next_index: usize,
    closed: bool,
}

impl MemoryStream {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(slot) = self.lock().slots.get_mut(&self.slot_name) {
            slot.active = false;
        }
    }
}

#[async_trait]
impl ReplicationStream for MemoryStream {
    async fn fetch_next(&mut self, timeout: Duration) -> Result<FetchStatus> {
        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.notify);

        loop {
            let notified = notify.notified();

            {
                let state = self.lock();
                state.check_reachable()?;
                if self.closed {
                    return Err(Error::Protocol("stream is closed".to_string()));
                }
                if let Some(entry) = state.wal.get(self.next_index) {
                    let record = ChangeRecord {
                        position: entry.position,
                        wal_end: Lsn(state.next_lsn),
                        server_time: Utc::now(),
                        data: entry.data.clone(),
                    };
                    drop(state);
                    self.next_index += 1;
                    return Ok(FetchStatus::Data(record));
                }
                if state.ended {
                    return Ok(FetchStatus::End);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(FetchStatus::NoData);
            }
        }
    }

    async fn flush(&mut self, position: Lsn) -> Result<()> {
        let mut state = self.lock();
        state.check_reachable()?;
        if let Some(slot) = state.slots.get_mut(&self.slot_name) {
            slot.confirmed = slot.confirmed.max(position);
            slot.flushes.push(position);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.release();
    }
}
