//! CopyBoth subprotocol framing.
//!
//! Inside the CopyBoth stream every CopyData payload is either an XLogData
//! frame carrying a pgoutput message or a primary keepalive. In the other
//! direction the client sends standby status updates to acknowledge LSNs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch
/// (2000-01-01 00:00:00 UTC).
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// A parsed CopyData payload received on the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// WAL data: a pgoutput message spanning `[start_lsn, end_lsn)`.
    XLogData {
        start_lsn: u64,
        end_lsn: u64,
        /// Server clock at send time, microseconds since the PostgreSQL epoch.
        timestamp: i64,
        data: Bytes,
    },
    /// Primary keepalive; `reply` asks for an immediate status update.
    Keepalive {
        wal_end: u64,
        timestamp: i64,
        reply: bool,
    },
}

impl Frame {
    /// Parse a CopyData payload into a frame.
    pub fn parse(mut data: Bytes) -> Result<Frame> {
        if data.is_empty() {
            return Err(Error::InvalidMessage {
                message: "empty replication frame".to_string(),
            });
        }

        let tag = data.get_u8();
        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::InvalidMessage {
                        message: "XLogData header shorter than 24 bytes".to_string(),
                    });
                }
                let start_lsn = data.get_u64();
                let end_lsn = data.get_u64();
                let timestamp = data.get_i64();
                Ok(Frame::XLogData {
                    start_lsn,
                    end_lsn,
                    timestamp,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::InvalidMessage {
                        message: "keepalive shorter than 17 bytes".to_string(),
                    });
                }
                let wal_end = data.get_u64();
                let timestamp = data.get_i64();
                let reply = data.get_u8() != 0;
                Ok(Frame::Keepalive {
                    wal_end,
                    timestamp,
                    reply,
                })
            }
            other => Err(Error::InvalidMessage {
                message: format!("unknown replication frame tag: '{}'", other as char),
            }),
        }
    }
}

/// Encode a standby status update acknowledging `lsn`.
///
/// Written, flushed and applied positions are all reported as `lsn`; the
/// server may then release WAL up to that point. The reply-request flag is
/// never set.
pub fn standby_status_update(lsn: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_i64(pg_epoch_micros());
    buf.put_u8(0);
    buf.freeze()
}

fn pg_epoch_micros() -> i64 {
    let pg_epoch =
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(PG_EPOCH_UNIX_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Convert a pgoutput timestamp (µs since the PostgreSQL epoch) to UTC.
pub fn pg_timestamp_to_utc(micros: i64) -> chrono::DateTime<chrono::Utc> {
    let unix_micros = micros + (PG_EPOCH_UNIX_SECS as i64) * 1_000_000;
    chrono::DateTime::from_timestamp_micros(unix_micros).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xlogdata_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(100);
        buf.put_u64(200);
        buf.put_i64(42);
        buf.put_slice(b"payload");

        match Frame::parse(buf.freeze()).unwrap() {
            Frame::XLogData {
                start_lsn,
                end_lsn,
                timestamp,
                data,
            } => {
                assert_eq!(start_lsn, 100);
                assert_eq!(end_lsn, 200);
                assert_eq!(timestamp, 42);
                assert_eq!(&data[..], b"payload");
            }
            other => panic!("expected XLogData, got {other:?}"),
        }
    }

    #[test]
    fn parse_keepalive_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(500);
        buf.put_i64(7);
        buf.put_u8(1);

        match Frame::parse(buf.freeze()).unwrap() {
            Frame::Keepalive {
                wal_end, reply, ..
            } => {
                assert_eq!(wal_end, 500);
                assert!(reply);
            }
            other => panic!("expected Keepalive, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_and_unknown_frames() {
        assert!(Frame::parse(Bytes::new()).is_err());
        assert!(Frame::parse(Bytes::from_static(b"w12")).is_err());
        assert!(Frame::parse(Bytes::from_static(b"z")).is_err());
    }

    #[test]
    fn status_update_layout() {
        let update = standby_status_update(0xDEAD_BEEF);
        assert_eq!(update.len(), 34);
        assert_eq!(update[0], b'r');
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&update[1..9]);
        assert_eq!(u64::from_be_bytes(lsn), 0xDEAD_BEEF);
        // write == flush == apply
        assert_eq!(update[1..9], update[9..17]);
        assert_eq!(update[9..17], update[17..25]);
        // no reply requested
        assert_eq!(update[33], 0);
    }

    #[test]
    fn pg_epoch_conversion() {
        let ts = pg_timestamp_to_utc(0);
        assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:00+00:00");
    }
}
