//! DuckDB value conversion

use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, ValueRef};
use serde_json::Value;

/// Days from 0001-01-01 to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn wide_int(value: i128) -> Value {
    i64::try_from(value)
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(value.to_string()))
}

fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Convert one cell to JSON
///
/// Numbers stay numbers where JSON can hold them; temporal values become
/// ISO-like strings; nested and exotic types are rendered as text markers.
pub fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::HugeInt(i) => wide_int(i),
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => float(f64::from(f)),
        ValueRef::Double(f) => float(f),
        ValueRef::Decimal(d) => Value::String(d.to_string()),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        ValueRef::Date32(days) => days
            .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|ts| Value::String(ts.naive_utc().to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let secs = micros / 1_000_000;
            Value::String(format!(
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                micros % 1_000_000
            ))
        }
        _ => Value::String("<unsupported>".to_string()),
    }
}
