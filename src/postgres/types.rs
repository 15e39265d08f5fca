//! Text-format column decoding.
//!
//! pgoutput sends tuple values in PostgreSQL's text format. This module maps
//! a built-in type OID to a decoder producing a native JSON value. Unknown
//! OIDs fall back to the string decoder; SQL NULL never reaches a decoder.

use serde_json::Value;

// Scalar type OIDs (pg_type.oid).
const BOOL: u32 = 16;
const BYTEA: u32 = 17;
const CHAR: u32 = 18;
const NAME: u32 = 19;
const INT8: u32 = 20;
const INT2: u32 = 21;
const INT4: u32 = 23;
const OID: u32 = 26;
const XID: u32 = 28;
const CID: u32 = 29;
const XID8: u32 = 5069;
const JSON: u32 = 114;
const JSONB: u32 = 3802;
const FLOAT4: u32 = 700;
const FLOAT8: u32 = 701;
const NUMERIC: u32 = 1700;
const MONEY: u32 = 790;

/// OIDs of the `reg*` alias types, which render as object identifiers.
const REG_TYPES: &[u32] = &[24, 2202, 2203, 2204, 2205, 2206, 3734, 3769, 4089, 4096, 4191];

/// Decode one text-format column value for the given type OID.
pub fn decode_value(type_oid: u32, text: &str) -> Value {
    if let Some(element_oid) = array_element_oid(type_oid) {
        return parse_array(text, element_oid);
    }
    decode_scalar(type_oid, text)
}

fn decode_scalar(type_oid: u32, text: &str) -> Value {
    match type_oid {
        BOOL => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },

        INT2 | INT4 | INT8 | OID | XID | CID | XID8 => integer(text),
        oid if REG_TYPES.contains(&oid) => integer(text),

        FLOAT4 | FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),

        JSON | JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }

        // Everything else keeps its text rendering: numeric/money (so
        // arbitrary precision survives), bytea (\x hex form), date/time
        // types, uuid, inet/cidr, bit, geometry, ranges, tsvector, pg_lsn.
        BYTEA | CHAR | NAME | NUMERIC | MONEY => Value::String(text.to_string()),
        _ => Value::String(text.to_string()),
    }
}

fn integer(text: &str) -> Value {
    text.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Element type for an array OID, or `None` when the OID is not an array
/// type we know. Mirrors the `_typ` → `typ` pairs in pg_type.
fn array_element_oid(type_oid: u32) -> Option<u32> {
    let element = match type_oid {
        1000 => BOOL,
        1001 => BYTEA,
        1002 => CHAR,
        1003 => NAME,
        1005 => INT2,
        1007 => INT4,
        1016 => INT8,
        1009 => 25,   // _text
        1028 => OID,
        1011 => XID,
        1012 => CID,
        271 => XID8,
        1021 => FLOAT4,
        1022 => FLOAT8,
        791 => MONEY,
        1014 => 1042, // _bpchar
        1015 => 1043, // _varchar
        1182 => 1082, // _date
        1183 => 1083, // _time
        1115 => 1114, // _timestamp
        1185 => 1184, // _timestamptz
        1270 => 1266, // _timetz
        1187 => 1186, // _interval
        1231 => NUMERIC,
        2951 => 2950, // _uuid
        199 => JSON,
        3807 => JSONB,
        1041 => 869,  // _inet
        651 => 650,   // _cidr
        1040 => 829,  // _macaddr
        143 => 142,   // _xml
        1561 => 1560, // _bit
        1563 => 1562, // _varbit
        1017 => 600,  // _point
        3643 => 3614, // _tsvector
        3645 => 3615, // _tsquery
        3221 => 3220, // _pg_lsn
        1008 => 24,   // _regproc
        2207 => 2202,
        2208 => 2203,
        2209 => 2204,
        2210 => 2205,
        2211 => 2206,
        3735 => 3734,
        3770 => 3769,
        4090 => 4089,
        4097 => 4096,
        4192 => 4191,
        // Range arrays decode their elements as strings.
        3905 => 3904,
        3907 => 3906,
        3909 => 3908,
        3911 => 3910,
        3913 => 3912,
        3927 => 3926,
        _ => return None,
    };
    Some(element)
}

/// Parse a PostgreSQL array literal (`{a,b,NULL,"c,d"}`) into a JSON array,
/// decoding each element with the element type's decoder. Nested braces
/// produce nested arrays. Malformed input falls back to the raw string.
pub fn parse_array(text: &str, element_oid: u32) -> Value {
    let trimmed = text.trim();
    // Literals may carry a dimension prefix like `[1:2]={...}`.
    let body = match trimmed.find('{') {
        Some(start) => &trimmed[start..],
        None => return Value::String(text.to_string()),
    };

    let mut chars = body.chars().peekable();
    match parse_array_body(&mut chars, element_oid) {
        Some(value) if chars.next().is_none() => value,
        _ => Value::String(text.to_string()),
    }
}

fn parse_array_body(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    element_oid: u32,
) -> Option<Value> {
    if chars.next() != Some('{') {
        return None;
    }

    let mut elements = Vec::new();
    loop {
        match chars.peek()? {
            '}' => {
                chars.next();
                return Some(Value::Array(elements));
            }
            '{' => {
                elements.push(parse_array_body(chars, element_oid)?);
            }
            '"' => {
                elements.push(decode_scalar(element_oid, &parse_quoted(chars)?));
            }
            _ => {
                let token = parse_bare(chars);
                if token.eq_ignore_ascii_case("NULL") {
                    elements.push(Value::Null);
                } else {
                    elements.push(decode_scalar(element_oid, &token));
                }
            }
        }

        match chars.peek() {
            Some(',') => {
                chars.next();
            }
            Some('}') => {}
            _ => return None,
        }
    }
}

fn parse_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
    chars.next(); // opening quote
    let mut out = String::new();
    loop {
        match chars.next()? {
            '\\' => out.push(chars.next()?),
            '"' => return Some(out),
            c => out.push(c),
        }
    }
}

fn parse_bare(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if c == ',' || c == '}' {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}
