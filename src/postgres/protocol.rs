//! Payloads carried inside CopyData while a walsender connection streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::lsn::Lsn;
use crate::types::{datetime_to_pg_micros, pg_micros_to_datetime, ChangeRecord};
use crate::{Error, Result};

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';

/// Server-to-client replication messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyBothMessage {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time: DateTime<Utc>,
        data: Bytes,
    },
    Keepalive {
        wal_end: Lsn,
        server_time: DateTime<Utc>,
        reply: bool,
    },
}

impl CopyBothMessage {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Protocol("Empty CopyData message".to_string()));
        }

        let mut cursor = data;
        let tag = cursor.get_u8();

        match tag {
            XLOG_DATA_TAG => {
                if cursor.remaining() < 24 {
                    return Err(Error::Protocol(format!(
                        "XLogData header too short: {} bytes",
                        cursor.remaining()
                    )));
                }

                let wal_start = Lsn(cursor.get_u64());
                let wal_end = Lsn(cursor.get_u64());
                let server_time = pg_micros_to_datetime(cursor.get_i64());

                Ok(CopyBothMessage::XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data: cursor,
                })
            }
            KEEPALIVE_TAG => {
                if cursor.remaining() < 17 {
                    return Err(Error::Protocol(format!(
                        "Invalid keepalive message size: {} bytes",
                        cursor.remaining()
                    )));
                }

                let wal_end = Lsn(cursor.get_u64());
                let server_time = pg_micros_to_datetime(cursor.get_i64());
                let reply = cursor.get_u8() != 0;

                Ok(CopyBothMessage::Keepalive {
                    wal_end,
                    server_time,
                    reply,
                })
            }
            _ => Err(Error::Protocol(format!(
                "Unknown CopyData tag: 0x{:02x}",
                tag
            ))),
        }
    }

    /// Converts XLogData into the record handed downstream.
    pub fn into_record(self) -> Option<ChangeRecord> {
        match self {
            CopyBothMessage::XLogData {
                wal_start,
                wal_end,
                server_time,
                data,
            } => Some(ChangeRecord {
                position: wal_start,
                wal_end,
                server_time,
                data,
            }),
            CopyBothMessage::Keepalive { .. } => None,
        }
    }
}

/// Encodes a standby status update confirming everything up to `lsn`.
///
/// Written, flushed and applied positions are all reported as `lsn`.
pub fn standby_status_update(lsn: Lsn, now: DateTime<Utc>, reply: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STATUS_UPDATE_TAG);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_i64(datetime_to_pg_micros(now));
    buf.put_u8(u8::from(reply));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlog_data(start: u64, end: u64, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(start);
        buf.put_u64(end);
        buf.put_i64(0);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn test_parse_xlog_data() {
        let message = CopyBothMessage::parse(xlog_data(
            0x16B3748,
            0x16B3800,
            b"BEGIN 731",
        ))
        .unwrap();

        let record = message.into_record().unwrap();
        assert_eq!(record.position, Lsn(0x16B3748));
        assert_eq!(record.wal_end, Lsn(0x16B3800));
        assert_eq!(record.server_time.to_rfc3339(), "2000-01-01T00:00:00+00:00");
        assert_eq!(record.text(), "BEGIN 731");
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x2000);
        buf.put_i64(1_000_000);
        buf.put_u8(1);

        let message = CopyBothMessage::parse(buf.freeze()).unwrap();
        match &message {
            CopyBothMessage::Keepalive {
                wal_end,
                server_time,
                reply,
            } => {
                assert_eq!(*wal_end, Lsn(0x2000));
                assert_eq!(server_time.to_rfc3339(), "2000-01-01T00:00:01+00:00");
                assert!(*reply);
            }
            other => panic!("expected keepalive, got {:?}", other),
        }
        assert!(message.into_record().is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_messages() {
        assert!(matches!(
            CopyBothMessage::parse(Bytes::new()),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            CopyBothMessage::parse(Bytes::from_static(b"w\x00\x01")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            CopyBothMessage::parse(Bytes::from_static(b"k\x00")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            CopyBothMessage::parse(Bytes::from_static(b"x")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_standby_status_update_layout() {
        let now = pg_micros_to_datetime(42);
        let payload = standby_status_update(Lsn(0x1_0000_0010), now, false);

        assert_eq!(payload.len(), 34);
        let mut cursor = payload;
        assert_eq!(cursor.get_u8(), b'r');
        assert_eq!(cursor.get_u64(), 0x1_0000_0010);
        assert_eq!(cursor.get_u64(), 0x1_0000_0010);
        assert_eq!(cursor.get_u64(), 0x1_0000_0010);
        assert_eq!(cursor.get_i64(), 42);
        assert_eq!(cursor.get_u8(), 0);
    }
}
