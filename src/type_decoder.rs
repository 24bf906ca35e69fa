//! PostgreSQL type OID → `serde_json::Value` decoding (C4).
//!
//! The Go original's `decodeTextColumnData` (`pkg/drivers/wal/process.go`)
//! resolves OIDs through `pgtype.Map.TypeForOID` and falls back to the raw
//! string for anything it doesn't recognize; this module is that table,
//! built out in full, addressed by the well-known OIDs from PostgreSQL's
//! `pg_type.dat` rather than a runtime catalog lookup (the WAL driver never
//! has catalog access; only the wire-level OID and the text value are
//! available). DATE/TIMESTAMP/TIMESTAMPTZ parsing follows the teacher's
//! `event_sink::pg_type_conversion` (`NaiveDate`/`NaiveDateTime::from_str`,
//! `DateTime::parse_from_str` with PostgreSQL's default text format).

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

// Well-known OIDs (see PostgreSQL's src/include/catalog/pg_type.dat).
const BOOL: u32 = 16;
const INT2: u32 = 21;
const INT4: u32 = 23;
const INT8: u32 = 20;
const FLOAT4: u32 = 700;
const FLOAT8: u32 = 701;
const NUMERIC: u32 = 1700;
const TEXT: u32 = 25;
const VARCHAR: u32 = 1043;
const BPCHAR: u32 = 1042;
const NAME: u32 = 19;
const UUID: u32 = 2950;
const JSON: u32 = 114;
const JSONB: u32 = 3802;
const DATE: u32 = 1082;
const TIMESTAMP: u32 = 1114;
const TIMESTAMPTZ: u32 = 1184;
const BYTEA: u32 = 17;

const BOOL_ARRAY: u32 = 1000;
const INT2_ARRAY: u32 = 1005;
const INT4_ARRAY: u32 = 1007;
const INT8_ARRAY: u32 = 1016;
const FLOAT4_ARRAY: u32 = 1021;
const FLOAT8_ARRAY: u32 = 1022;
const TEXT_ARRAY: u32 = 1009;
const VARCHAR_ARRAY: u32 = 1015;

/// Decodes a text-format wire value for `type_oid` into a [`Value`].
///
/// Unknown OIDs fall back to a JSON string holding the raw text, matching
/// the original's behavior of never dropping a column it doesn't have a
/// decoder for.
pub fn decode(type_oid: u32, raw: &str) -> Value {
    match type_oid {
        BOOL => decode_bool(raw),
        INT2 | INT4 | INT8 => decode_int(raw),
        FLOAT4 | FLOAT8 => decode_float(raw),
        NUMERIC => decode_numeric(raw),
        TEXT | VARCHAR | BPCHAR | NAME | UUID => Value::String(raw.to_string()),
        JSON | JSONB => decode_json(raw),
        DATE => decode_date(raw),
        TIMESTAMP => decode_timestamp(raw),
        TIMESTAMPTZ => decode_timestamptz(raw),
        BYTEA => decode_bytea(raw),
        BOOL_ARRAY | INT2_ARRAY | INT4_ARRAY | INT8_ARRAY | FLOAT4_ARRAY | FLOAT8_ARRAY
        | TEXT_ARRAY | VARCHAR_ARRAY => decode_1d_array(type_oid, raw),
        _ => Value::String(raw.to_string()),
    }
}

fn decode_bool(raw: &str) -> Value {
    match raw {
        "t" => Value::Bool(true),
        "f" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

fn decode_int(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn decode_float(raw: &str) -> Value {
    match raw {
        "NaN" | "Infinity" | "-Infinity" => Value::String(raw.to_string()),
        _ => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
    }
}

/// NUMERIC is arbitrary precision; representing it as a JSON number would
/// silently truncate. Kept as its canonical decimal string, as the original
/// does for unrecognized-as-float types.
fn decode_numeric(raw: &str) -> Value {
    Value::String(raw.to_string())
}

fn decode_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `date`'s text output is `YYYY-MM-DD`; re-emitted as that same ISO string
/// once validated, rather than left unparsed, so a malformed value is
/// distinguishable from a deliberately-unparsed type.
fn decode_date(raw: &str) -> Value {
    NaiveDate::from_str(raw)
        .map(|d| Value::String(d.to_string()))
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `timestamp`'s text output is `YYYY-MM-DD HH:MM:SS[.ffffff]`, no timezone.
fn decode_timestamp(raw: &str) -> Value {
    NaiveDateTime::from_str(raw)
        .map(|d| Value::String(d.to_string()))
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `timestamptz` comes off the wire already converted to the session's
/// `TimeZone` with a numeric UTC offset appended, e.g.
/// `2024-01-02 03:04:05.678901+00`.
fn decode_timestamptz(raw: &str) -> Value {
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|d| Value::String(d.to_utc().to_rfc3339()))
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `bytea`'s text format is `\x` followed by hex pairs; represented as that
/// same hex string rather than decoding to raw bytes, since the event
/// contract's column values are JSON.
fn decode_bytea(raw: &str) -> Value {
    Value::String(raw.to_string())
}

/// PostgreSQL's array text format: `{elem,elem,...}`, with `NULL` (unquoted)
/// for SQL NULL elements and double-quoting for elements containing commas,
/// braces, or quotes. Only one-dimensional arrays are handled, per
/// spec.md §4.4's scope.
fn decode_1d_array(type_oid: u32, raw: &str) -> Value {
    let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
        return Value::String(raw.to_string());
    };
    if inner.is_empty() {
        return Value::Array(Vec::new());
    }

    let element_oid = match type_oid {
        BOOL_ARRAY => BOOL,
        INT2_ARRAY => INT2,
        INT4_ARRAY => INT4,
        INT8_ARRAY => INT8,
        FLOAT4_ARRAY => FLOAT4,
        FLOAT8_ARRAY => FLOAT8,
        TEXT_ARRAY => TEXT,
        VARCHAR_ARRAY => VARCHAR,
        _ => TEXT,
    };

    let elements = split_array_elements(inner);
    Value::Array(
        elements
            .into_iter()
            .map(|e| {
                if e == "NULL" {
                    Value::Null
                } else {
                    let unquoted = unquote_array_element(&e);
                    decode(element_oid, &unquoted)
                }
            })
            .collect(),
    )
}

fn split_array_elements(inner: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => in_quotes = true,
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            ',' if !in_quotes => {
                elements.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    elements.push(current);
    elements
}

fn unquote_array_element(raw: &str) -> String {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
        .to_string()
}
