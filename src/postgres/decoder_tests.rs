#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use bytes::{BufMut, Bytes, BytesMut};

    fn begin_message(xid: u32, final_lsn: u64, timestamp: i64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    fn commit_message(commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0); // flags
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(0);
        buf.freeze()
    }

    fn relation_message(oid: u32, schema: &str, table: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(oid);
        buf.put(schema.as_bytes());
        buf.put_u8(0);
        buf.put(table.as_bytes());
        buf.put_u8(0);
        buf.put_u8(b'd'); // replica identity: default
        buf.put_u16(columns.len() as u16);
        for (name, type_oid, is_key) in columns {
            buf.put_u8(u8::from(*is_key));
            buf.put(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(*type_oid);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    enum Cell<'a> {
        Text(&'a str),
        Null,
        Toast,
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

    fn insert_message(oid: u32, values: &[Cell<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(oid);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    fn update_message(oid: u32, old: Option<&[Cell<'_>]>, new: &[Cell<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(oid);
        if let Some(old) = old {
            buf.put_u8(b'O');
            put_tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    fn delete_message(oid: u32, marker: u8, old: &[Cell<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(oid);
        buf.put_u8(marker);
        put_tuple(&mut buf, old);
        buf.freeze()
    }

    fn logical_message(transactional: bool, lsn: u64, prefix: &str, content: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        buf.put_u8(u8::from(transactional));
        buf.put_u64(lsn);
        buf.put(prefix.as_bytes());
        buf.put_u8(0);
        buf.put_u32(content.len() as u32);
        buf.put(content);
        buf.freeze()
    }

    fn text(value: &TupleValue) -> &str {
        match value {
            TupleValue::Text(bytes) => std::str::from_utf8(bytes).unwrap(),
            other => panic!("expected text value, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_begin() {
        let msg = PgOutputMessage::decode(begin_message(12345, 1000, 42)).unwrap();
        match msg {
            PgOutputMessage::Begin(body) => {
                assert_eq!(body.xid, 12345);
                assert_eq!(body.final_lsn, 1000);
                assert_eq!(body.timestamp, 42);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_commit() {
        let msg = PgOutputMessage::decode(commit_message(2000, 2100)).unwrap();
        match msg {
            PgOutputMessage::Commit(body) => {
                assert_eq!(body.commit_lsn, 2000);
                assert_eq!(body.end_lsn, 2100);
            }
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_relation() {
        let columns = [("id", 23, true), ("name", 25, false), ("active", 16, false)];
        let msg =
            PgOutputMessage::decode(relation_message(100, "public", "users", &columns)).unwrap();
        match msg {
            PgOutputMessage::Relation(body) => {
                assert_eq!(body.oid, 100);
                assert_eq!(body.namespace, "public");
                assert_eq!(body.name, "users");
                assert_eq!(body.columns.len(), 3);
                assert_eq!(body.columns[0].name, "id");
                assert_eq!(body.columns[0].type_oid, 23);
                assert_eq!(body.columns[0].flags & 1, 1);
                assert_eq!(body.columns[1].flags & 1, 0);
            }
            other => panic!("expected Relation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_insert() {
        let msg = PgOutputMessage::decode(insert_message(
            100,
            &[Cell::Text("42"), Cell::Text("John Doe"), Cell::Null],
        ))
        .unwrap();
        match msg {
            PgOutputMessage::Insert { relation_oid, new } => {
                assert_eq!(relation_oid, 100);
                assert_eq!(new.0.len(), 3);
                assert_eq!(text(&new.0[0]), "42");
                assert_eq!(text(&new.0[1]), "John Doe");
                assert_eq!(new.0[2], TupleValue::Null);
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_old_image() {
        let msg = PgOutputMessage::decode(update_message(
            200,
            Some(&[Cell::Text("10"), Cell::Text("Old Name")]),
            &[Cell::Text("10"), Cell::Text("New Name")],
        ))
        .unwrap();
        match msg {
            PgOutputMessage::Update { old, key, new, .. } => {
                let old = old.expect("old image present");
                assert!(key.is_none());
                assert_eq!(text(&old.0[1]), "Old Name");
                assert_eq!(text(&new.0[1]), "New Name");
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_without_old_image() {
        let msg = PgOutputMessage::decode(update_message(200, None, &[Cell::Text("10")])).unwrap();
        match msg {
            PgOutputMessage::Update { old, key, .. } => {
                assert!(old.is_none());
                assert!(key.is_none());
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_toast_marker() {
        let msg = PgOutputMessage::decode(update_message(
            200,
            None,
            &[Cell::Text("10"), Cell::Toast],
        ))
        .unwrap();
        match msg {
            PgOutputMessage::Update { new, .. } => {
                assert_eq!(new.0[1], TupleValue::Toast);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_key_image() {
        let msg =
            PgOutputMessage::decode(delete_message(300, b'K', &[Cell::Text("99")])).unwrap();
        match msg {
            PgOutputMessage::Delete { old, key, .. } => {
                assert!(old.is_none());
                assert_eq!(text(&key.unwrap().0[0]), "99");
            }
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_full_old_image() {
        let msg = PgOutputMessage::decode(delete_message(
            300,
            b'O',
            &[Cell::Text("99"), Cell::Text("Deleted Item")],
        ))
        .unwrap();
        match msg {
            PgOutputMessage::Delete { old, key, .. } => {
                assert!(key.is_none());
                assert_eq!(text(&old.unwrap().0[1]), "Deleted Item");
            }
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_logical_message() {
        let msg = PgOutputMessage::decode(logical_message(
            true,
            777,
            "test_context",
            br#"{"name":"c1"}"#,
        ))
        .unwrap();
        match msg {
            PgOutputMessage::Message {
                transactional,
                lsn,
                prefix,
                content,
            } => {
                assert!(transactional);
                assert_eq!(lsn, 777);
                assert_eq!(prefix, "test_context");
                assert_eq!(&content[..], br#"{"name":"c1"}"#);
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncate() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(2);
        buf.put_u8(0);
        buf.put_u32(100);
        buf.put_u32(200);
        let msg = PgOutputMessage::decode(buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Truncate { relation_oids, .. } => {
                assert_eq!(relation_oids, vec![100, 200]);
            }
            other => panic!("expected Truncate, got {other:?}"),
        }
    }

    #[test]
    fn test_error_handling() {
        // Empty payload.
        assert!(PgOutputMessage::decode(Bytes::new()).is_err());

        // Unknown message tag.
        assert!(PgOutputMessage::decode(Bytes::from_static(b"x123")).is_err());

        // Truncated begin.
        let truncated = begin_message(123, 456, 0).slice(..10);
        assert!(PgOutputMessage::decode(truncated).is_err());

        // Insert missing its new-tuple marker.
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(100);
        buf.put_u8(b'X');
        assert!(PgOutputMessage::decode(buf.freeze()).is_err());
    }
}
