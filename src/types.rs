use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::lsn::Lsn;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800 * 1_000_000;

/// One unit of decoded output streamed from a replication slot.
///
/// The payload is whatever the slot's output plugin produced; it is not
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// WAL position of the record.
    pub position: Lsn,
    /// Server WAL end at the time the record was sent.
    pub wal_end: Lsn,
    /// Server clock at the time the record was sent.
    pub server_time: DateTime<Utc>,
    pub data: Bytes,
}

impl ChangeRecord {
    pub fn new(position: Lsn, data: impl Into<Bytes>) -> Self {
        Self {
            position,
            wal_end: position,
            server_time: Utc::now(),
            data: data.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Outcome of a single poll on an open replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Data(ChangeRecord),
    NoData,
    End,
}

/// What a finished streaming session achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Position the session started from.
    pub start: Lsn,
    /// Last position confirmed to the source.
    pub flushed: Lsn,
    /// Number of records handed to the sink.
    pub records: u64,
}

/// Converts PostgreSQL epoch microseconds to a UTC timestamp.
pub fn pg_micros_to_datetime(micros: i64) -> DateTime<Utc> {
    let unix = micros.saturating_add(PG_EPOCH_OFFSET_MICROS);
    Utc.timestamp_micros(unix)
        .single()
        .unwrap_or_default()
}

/// Converts a UTC timestamp to PostgreSQL epoch microseconds.
pub fn datetime_to_pg_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}
