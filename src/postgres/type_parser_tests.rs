#[cfg(test)]
mod tests {
    use crate::postgres::types::decode_value;
    use serde_json::{json, Value};

    #[test]
    fn test_bool_decoding() {
        assert_eq!(decode_value(16, "t"), Value::Bool(true));
        assert_eq!(decode_value(16, "f"), Value::Bool(false));
        assert_eq!(decode_value(16, "invalid"), json!("invalid"));
    }

    #[test]
    fn test_integer_decoding() {
        // int2
        assert_eq!(decode_value(21, "123"), json!(123));
        assert_eq!(decode_value(21, "invalid"), json!("invalid"));

        // int4
        assert_eq!(decode_value(23, "456789"), json!(456789));

        // int8
        assert_eq!(decode_value(20, "9876543210"), json!(9876543210i64));

        // oid / xid / cid / xid8 render as integers too
        assert_eq!(decode_value(26, "16384"), json!(16384));
        assert_eq!(decode_value(28, "742"), json!(742));
        assert_eq!(decode_value(29, "3"), json!(3));
        assert_eq!(decode_value(5069, "123456789012"), json!(123456789012i64));
    }

    #[test]
    fn test_reg_aliases_decode_as_integers() {
        // regproc and regclass
        assert_eq!(decode_value(24, "1242"), json!(1242));
        assert_eq!(decode_value(2205, "16385"), json!(16385));
    }

    #[test]
    fn test_float_decoding() {
        let result = decode_value(700, "3.14");
        assert!((result.as_f64().unwrap() - 3.14).abs() < 0.001);

        assert_eq!(decode_value(701, "2.718281828"), json!(2.718281828));

        // Non-finite values keep their text form.
        assert_eq!(decode_value(701, "Infinity"), json!("Infinity"));
        assert_eq!(decode_value(701, "NaN"), json!("NaN"));
    }

    #[test]
    fn test_numeric_and_money_preserve_precision() {
        assert_eq!(
            decode_value(1700, "123456789012345678901234567890.42"),
            json!("123456789012345678901234567890.42")
        );
        assert_eq!(decode_value(790, "$1,234.56"), json!("$1,234.56"));
    }

    #[test]
    fn test_json_decoding() {
        assert_eq!(
            decode_value(114, r#"{"key": "value"}"#),
            json!({"key": "value"})
        );
        assert_eq!(decode_value(3802, r#"[1, 2, 3]"#), json!([1, 2, 3]));
        assert_eq!(decode_value(114, "not json"), json!("not json"));
    }

    #[test]
    fn test_string_families_pass_through() {
        assert_eq!(decode_value(25, "hello"), json!("hello"));
        assert_eq!(decode_value(1043, "varchar"), json!("varchar"));
        assert_eq!(decode_value(1042, "padded "), json!("padded "));
        assert_eq!(
            decode_value(2950, "550e8400-e29b-41d4-a716-446655440000"),
            json!("550e8400-e29b-41d4-a716-446655440000")
        );
        assert_eq!(decode_value(1184, "2023-10-15 10:30:00+00"), json!("2023-10-15 10:30:00+00"));
        assert_eq!(decode_value(1186, "1 day 02:00:00"), json!("1 day 02:00:00"));
        assert_eq!(decode_value(869, "192.168.0.1/24"), json!("192.168.0.1/24"));
        assert_eq!(decode_value(3904, "[1,10)"), json!("[1,10)"));
        assert_eq!(decode_value(4451, "{[1,3),[5,7)}"), json!("{[1,3),[5,7)}"));
        assert_eq!(decode_value(3220, "0/16B3748"), json!("0/16B3748"));
        assert_eq!(decode_value(17, "\\x48656c6c6f"), json!("\\x48656c6c6f"));
    }

    #[test]
    fn test_unknown_oid_falls_back_to_string() {
        assert_eq!(decode_value(999999, "whatever"), json!("whatever"));
    }

    #[test]
    fn test_integer_array() {
        assert_eq!(decode_value(1007, "{1,2,3,4,5}"), json!([1, 2, 3, 4, 5]));
        assert_eq!(decode_value(1016, "{9876543210}"), json!([9876543210i64]));
    }

    #[test]
    fn test_text_array_with_quoting() {
        assert_eq!(decode_value(1009, "{hello,world}"), json!(["hello", "world"]));
        assert_eq!(
            decode_value(1009, r#"{"with, comma","with \"quote\""}"#),
            json!(["with, comma", "with \"quote\""])
        );
        assert_eq!(
            decode_value(1009, r#"{"back\\slash"}"#),
            json!(["back\\slash"])
        );
    }

    #[test]
    fn test_array_null_elements() {
        assert_eq!(decode_value(1007, "{1,NULL,3}"), json!([1, null, 3]));
        // A quoted "NULL" is the literal string, not SQL NULL.
        assert_eq!(decode_value(1009, r#"{"NULL"}"#), json!(["NULL"]));
    }

    #[test]
    fn test_bool_array() {
        assert_eq!(decode_value(1000, "{t,f,t}"), json!([true, false, true]));
    }

    #[test]
    fn test_empty_and_nested_arrays() {
        assert_eq!(decode_value(1007, "{}"), json!([]));
        assert_eq!(
            decode_value(1007, "{{1,2},{3,4}}"),
            json!([[1, 2], [3, 4]])
        );
    }

    #[test]
    fn test_array_with_dimension_prefix() {
        assert_eq!(decode_value(1007, "[0:2]={1,2,3}"), json!([1, 2, 3]));
    }

    #[test]
    fn test_malformed_array_falls_back_to_string() {
        assert_eq!(decode_value(1007, "{1,2"), json!("{1,2"));
        assert_eq!(decode_value(1007, "not an array"), json!("not an array"));
    }
}
