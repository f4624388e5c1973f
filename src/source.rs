//! The boundary between the replication core and the database it reads from.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::lsn::Lsn;
use crate::types::FetchStatus;
use crate::Result;

/// Slot management plus the ability to open replication streams.
///
/// Implemented by [`PgSource`](crate::postgres::PgSource) for PostgreSQL and by
/// [`MemorySource`](crate::memory::MemorySource) for in-process use.
#[async_trait]
pub trait ReplicationSource: Send + Sync + 'static {
    type Stream: ReplicationStream;

    async fn slot_exists(&self, slot_name: &str) -> Result<bool>;

    /// Creates the slot and returns the position streaming may start from.
    async fn create_slot(&self, slot_name: &str, plugin: &str) -> Result<Lsn>;

    async fn drop_slot(&self, slot_name: &str) -> Result<()>;

    async fn start_replication(
        &self,
        slot_name: &str,
        start: Lsn,
        plugin_options: &BTreeMap<String, String>,
    ) -> Result<Self::Stream>;
}

/// One open replication stream.
#[async_trait]
pub trait ReplicationStream: Send + 'static {
    /// Waits at most `timeout` for the next record.
    async fn fetch_next(&mut self, timeout: Duration) -> Result<FetchStatus>;

    /// Confirms to the source that everything up to `position` was consumed.
    async fn flush(&mut self, position: Lsn) -> Result<()>;

    /// Releases the stream. Calling it more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}
