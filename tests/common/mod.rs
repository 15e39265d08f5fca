//! Shared fixtures: synthetic replication frames carrying hand-built
//! pgoutput payloads, fed straight into the replicator's state machine.

use bytes::{BufMut, Bytes, BytesMut};
use pg_watch::postgres::Frame;

/// One column value in a hand-built tuple.
pub enum Cell<'a> {
    Text(&'a str),
    Null,
    Toast,
}

pub fn xlog(start_lsn: u64, payload: Bytes) -> Frame {
    Frame::XLogData {
        start_lsn,
        end_lsn: start_lsn,
        timestamp: 0,
        data: payload,
    }
}

pub fn begin(xid: u32, lsn: u64, final_lsn: u64) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(0);
    buf.put_u32(xid);
    xlog(lsn, buf.freeze())
}

pub fn commit(commit_lsn: u64, end_lsn: u64) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(commit_lsn);
    buf.put_u64(end_lsn);
    buf.put_i64(0);
    xlog(commit_lsn, buf.freeze())
}

pub fn relation(oid: u32, schema: &str, table: &str, columns: &[(&str, u32, bool)]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(oid);
    buf.put(schema.as_bytes());
    buf.put_u8(0);
    buf.put(table.as_bytes());
    buf.put_u8(0);
    buf.put_u8(b'f'); // replica identity: full
    buf.put_u16(columns.len() as u16);
    for (name, type_oid, is_key) in columns {
        buf.put_u8(u8::from(*is_key));
        buf.put(name.as_bytes());
        buf.put_u8(0);
        buf.put_u32(*type_oid);
        buf.put_i32(-1);
    }
    xlog(0, buf.freeze())
}

fn put_tuple(buf: &mut BytesMut, values: &[Cell<'_>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Cell::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put(text.as_bytes());
            }
            Cell::Null => buf.put_u8(b'n'),
            Cell::Toast => buf.put_u8(b'u'),
        }
    }
}

pub fn insert(lsn: u64, oid: u32, values: &[Cell<'_>]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(oid);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    xlog(lsn, buf.freeze())
}

pub fn update(lsn: u64, oid: u32, old: Option<&[Cell<'_>]>, new: &[Cell<'_>]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(oid);
    if let Some(old) = old {
        buf.put_u8(b'O');
        put_tuple(&mut buf, old);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    xlog(lsn, buf.freeze())
}

pub fn delete(lsn: u64, oid: u32, old: &[Cell<'_>]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(oid);
    buf.put_u8(b'O');
    put_tuple(&mut buf, old);
    xlog(lsn, buf.freeze())
}

pub fn logical_message(lsn: u64, prefix: &str, content: &[u8]) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(b'M');
    buf.put_u8(1);
    buf.put_u64(lsn);
    buf.put(prefix.as_bytes());
    buf.put_u8(0);
    buf.put_u32(content.len() as u32);
    buf.put(content);
    xlog(lsn, buf.freeze())
}

pub fn keepalive(wal_end: u64, reply: bool) -> Frame {
    Frame::Keepalive {
        wal_end,
        timestamp: 0,
        reply,
    }
}
