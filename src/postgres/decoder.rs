//! Binary pgoutput message decoding.
//!
//! Parses the payload of XLogData frames into typed messages. The decoder
//! is stateless; the replicator owns the relation cache and all
//! per-transaction state. Protocol versions 1 and 2 are understood; the
//! stream-control messages of version 2 decode but carry no row data.

use bytes::{Buf, Bytes};

use crate::{Error, Result};

/// One value position inside a tuple, parallel to the relation's columns.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    /// SQL NULL.
    Null,
    /// Unchanged TOASTed column omitted from the image.
    Toast,
    /// Text-format value bytes.
    Text(Bytes),
}

/// A row image as sent on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleData(pub Vec<TupleValue>);

#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    /// Bit 0 marks the column as part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginBody {
    pub final_lsn: u64,
    /// Microseconds since the PostgreSQL epoch (2000-01-01).
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

/// A decoded pgoutput message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Relation(RelationBody),
    Insert {
        relation_oid: u32,
        new: TupleData,
    },
    Update {
        relation_oid: u32,
        /// Full old image ('O'), present with REPLICA IDENTITY FULL.
        old: Option<TupleData>,
        /// Key-only old image ('K').
        key: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_oid: u32,
        old: Option<TupleData>,
        key: Option<TupleData>,
    },
    Truncate {
        options: u8,
        relation_oids: Vec<u32>,
    },
    Origin {
        commit_lsn: u64,
        name: String,
    },
    Type {
        oid: u32,
        namespace: String,
        name: String,
    },
    /// A logical message emitted with `pg_logical_emit_message`.
    Message {
        transactional: bool,
        lsn: u64,
        prefix: String,
        content: Bytes,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        timestamp: i64,
    },
    StreamAbort {
        xid: u32,
        subtransaction_xid: u32,
    },
}

impl PgOutputMessage {
    /// Decode a single pgoutput message from an XLogData payload.
    pub fn decode(mut data: Bytes) -> Result<PgOutputMessage> {
        let tag = read_u8(&mut data)?;
        match tag {
            b'B' => {
                let final_lsn = read_u64(&mut data)?;
                let timestamp = read_i64(&mut data)?;
                let xid = read_u32(&mut data)?;
                Ok(PgOutputMessage::Begin(BeginBody {
                    final_lsn,
                    timestamp,
                    xid,
                }))
            }
            b'C' => {
                let flags = read_u8(&mut data)?;
                let commit_lsn = read_u64(&mut data)?;
                let end_lsn = read_u64(&mut data)?;
                let timestamp = read_i64(&mut data)?;
                Ok(PgOutputMessage::Commit(CommitBody {
                    flags,
                    commit_lsn,
                    end_lsn,
                    timestamp,
                }))
            }
            b'R' => {
                let oid = read_u32(&mut data)?;
                let namespace = read_cstring(&mut data)?;
                let name = read_cstring(&mut data)?;
                let replica_identity = read_u8(&mut data)?;
                let num_columns = read_u16(&mut data)?;
                let mut columns = Vec::with_capacity(num_columns as usize);
                for _ in 0..num_columns {
                    let flags = read_u8(&mut data)?;
                    let name = read_cstring(&mut data)?;
                    let type_oid = read_u32(&mut data)?;
                    let type_modifier = read_i32(&mut data)?;
                    columns.push(RelationColumn {
                        flags,
                        name,
                        type_oid,
                        type_modifier,
                    });
                }
                Ok(PgOutputMessage::Relation(RelationBody {
                    oid,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                }))
            }
            b'I' => {
                let relation_oid = read_u32(&mut data)?;
                let marker = read_u8(&mut data)?;
                if marker != b'N' {
                    return Err(Error::InvalidMessage {
                        message: format!("expected new tuple in insert, got '{}'", marker as char),
                    });
                }
                let new = decode_tuple(&mut data)?;
                Ok(PgOutputMessage::Insert { relation_oid, new })
            }
            b'U' => {
                let relation_oid = read_u32(&mut data)?;
                let mut old = None;
                let mut key = None;
                let mut marker = read_u8(&mut data)?;
                match marker {
                    b'O' => {
                        old = Some(decode_tuple(&mut data)?);
                        marker = read_u8(&mut data)?;
                    }
                    b'K' => {
                        key = Some(decode_tuple(&mut data)?);
                        marker = read_u8(&mut data)?;
                    }
                    _ => {}
                }
                if marker != b'N' {
                    return Err(Error::InvalidMessage {
                        message: format!("expected new tuple in update, got '{}'", marker as char),
                    });
                }
                let new = decode_tuple(&mut data)?;
                Ok(PgOutputMessage::Update {
                    relation_oid,
                    old,
                    key,
                    new,
                })
            }
            b'D' => {
                let relation_oid = read_u32(&mut data)?;
                let marker = read_u8(&mut data)?;
                let (old, key) = match marker {
                    b'O' => (Some(decode_tuple(&mut data)?), None),
                    b'K' => (None, Some(decode_tuple(&mut data)?)),
                    other => {
                        return Err(Error::InvalidMessage {
                            message: format!(
                                "expected old or key tuple in delete, got '{}'",
                                other as char
                            ),
                        })
                    }
                };
                Ok(PgOutputMessage::Delete {
                    relation_oid,
                    old,
                    key,
                })
            }
            b'T' => {
                let num_relations = read_u32(&mut data)?;
                let options = read_u8(&mut data)?;
                let mut relation_oids = Vec::with_capacity(num_relations as usize);
                for _ in 0..num_relations {
                    relation_oids.push(read_u32(&mut data)?);
                }
                Ok(PgOutputMessage::Truncate {
                    options,
                    relation_oids,
                })
            }
            b'O' => {
                let commit_lsn = read_u64(&mut data)?;
                let name = read_cstring(&mut data)?;
                Ok(PgOutputMessage::Origin { commit_lsn, name })
            }
            b'Y' => {
                let oid = read_u32(&mut data)?;
                let namespace = read_cstring(&mut data)?;
                let name = read_cstring(&mut data)?;
                Ok(PgOutputMessage::Type {
                    oid,
                    namespace,
                    name,
                })
            }
            b'M' => {
                let flags = read_u8(&mut data)?;
                let lsn = read_u64(&mut data)?;
                let prefix = read_cstring(&mut data)?;
                let length = read_u32(&mut data)? as usize;
                if data.remaining() < length {
                    return Err(Error::InvalidMessage {
                        message: "truncated logical message content".to_string(),
                    });
                }
                let content = data.copy_to_bytes(length);
                Ok(PgOutputMessage::Message {
                    transactional: flags & 1 != 0,
                    lsn,
                    prefix,
                    content,
                })
            }
            b'S' => {
                let xid = read_u32(&mut data)?;
                let first_segment = read_u8(&mut data)? == 1;
                Ok(PgOutputMessage::StreamStart { xid, first_segment })
            }
            b'E' => Ok(PgOutputMessage::StreamStop),
            b'c' => {
                let xid = read_u32(&mut data)?;
                let flags = read_u8(&mut data)?;
                let commit_lsn = read_u64(&mut data)?;
                let end_lsn = read_u64(&mut data)?;
                let timestamp = read_i64(&mut data)?;
                Ok(PgOutputMessage::StreamCommit {
                    xid,
                    flags,
                    commit_lsn,
                    end_lsn,
                    timestamp,
                })
            }
            b'A' => {
                let xid = read_u32(&mut data)?;
                let subtransaction_xid = read_u32(&mut data)?;
                Ok(PgOutputMessage::StreamAbort {
                    xid,
                    subtransaction_xid,
                })
            }
            other => Err(Error::InvalidMessage {
                message: format!("unknown pgoutput message type: '{}'", other as char),
            }),
        }
    }
}

fn decode_tuple(data: &mut Bytes) -> Result<TupleData> {
    let num_columns = read_u16(data)?;
    let mut values = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let marker = read_u8(data)?;
        let value = match marker {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Toast,
            b't' => {
                let length = read_u32(data)? as usize;
                if data.remaining() < length {
                    return Err(Error::InvalidMessage {
                        message: "truncated tuple value".to_string(),
                    });
                }
                TupleValue::Text(data.copy_to_bytes(length))
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("unknown tuple value marker: '{}'", other as char),
                })
            }
        };
        values.push(value);
    }
    Ok(TupleData(values))
}

fn read_u8(data: &mut Bytes) -> Result<u8> {
    ensure(data, 1)?;
    Ok(data.get_u8())
}

fn read_u16(data: &mut Bytes) -> Result<u16> {
    ensure(data, 2)?;
    Ok(data.get_u16())
}

fn read_u32(data: &mut Bytes) -> Result<u32> {
    ensure(data, 4)?;
    Ok(data.get_u32())
}

fn read_i32(data: &mut Bytes) -> Result<i32> {
    ensure(data, 4)?;
    Ok(data.get_i32())
}

fn read_u64(data: &mut Bytes) -> Result<u64> {
    ensure(data, 8)?;
    Ok(data.get_u64())
}

fn read_i64(data: &mut Bytes) -> Result<i64> {
    ensure(data, 8)?;
    Ok(data.get_i64())
}

fn read_cstring(data: &mut Bytes) -> Result<String> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: "unterminated string".to_string(),
        })?;
    let raw = data.copy_to_bytes(end);
    data.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidMessage {
        message: "string is not valid UTF-8".to_string(),
    })
}

fn ensure(data: &Bytes, needed: usize) -> Result<()> {
    if data.remaining() < needed {
        return Err(Error::InvalidMessage {
            message: "message shorter than expected".to_string(),
        });
    }
    Ok(())
}
