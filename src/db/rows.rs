use duckdb::types::{TimeUnit, Value as DuckValue};
use serde_json::{Map, Number, Value};

/// One result row, keyed by column name in the statement's column order.
pub type RowMap = Map<String, Value>;

/// Converts a DuckDB value into JSON. Timestamps use `YYYY-MM-DD HH:MM:SS`.
pub fn to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => Value::from(small),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => float(f as f64),
        DuckValue::Double(f) => float(f),
        DuckValue::Decimal(d) => match d.to_string().parse::<f64>() {
            Ok(f) => float(f),
            Err(_) => Value::String(d.to_string()),
        },
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
        DuckValue::Timestamp(unit, raw) => chrono::DateTime::from_timestamp_micros(micros(unit, raw))
            .map(|ts| Value::String(ts.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Date32(days) => date(days),
        DuckValue::Time64(unit, raw) => {
            let us = micros(unit, raw);
            chrono::NaiveTime::from_num_seconds_from_midnight_opt(
                (us / 1_000_000) as u32,
                ((us % 1_000_000) * 1_000) as u32,
            )
            .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
            .unwrap_or(Value::Null)
        }
        DuckValue::List(items) => Value::Array(items.into_iter().map(to_json).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// `YYYY-MM-DD`, or DuckDB's spelling for the infinite dates outside chrono's range.
fn date(days: i32) -> Value {
    match days
        .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(chrono::NaiveDate::from_num_days_from_ce_opt)
    {
        Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        None if days > 0 => Value::String("infinity".to_string()),
        None => Value::String("-infinity".to_string()),
    }
}

fn micros(unit: TimeUnit, raw: i64) -> i64 {
    match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Flattens a list-ish DuckDB value (`VARCHAR[]` or its text form `[a, b]`).
pub fn to_strings(value: DuckValue) -> Vec<String> {
    match value {
        DuckValue::List(items) => items
            .into_iter()
            .filter_map(|item| match to_json(item) {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        DuckValue::Text(text) => text
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .map(|part| part.trim().trim_matches('"').to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        DuckValue::Null => Vec::new(),
        other => vec![format!("{:?}", other)],
    }
}

/// Makes column names unique so no value is lost when rows become maps.
pub fn unique_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let mut candidate = name.clone();
        let mut n = 2;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        seen.push(candidate);
    }
    seen
}
