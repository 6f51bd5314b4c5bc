//! # JSON Lines decoder
//!
//! Every non-blank line is an independent JSON object. A bad line is
//! reported and skipped; the rest of the request still applies.

use chrono::DateTime;
use lh_core::{DecodedRow, Field, TIME_FIELD};
use serde_json::Value;

use super::{DecodeOutcome, LineError};

/// Objects nested deeper than this fail the line.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonLineParams {
    /// Candidate timestamp keys; the first one present wins.
    pub time_fields: Vec<String>,
}

impl Default for JsonLineParams {
    fn default() -> Self {
        Self {
            time_fields: vec![TIME_FIELD.to_string()],
        }
    }
}

pub fn decode(data: &[u8], params: &JsonLineParams) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();
    for (i, line) in data.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_line(line, params) {
            Ok(row) => outcome.rows.push(row),
            Err(message) => outcome.skipped.push(LineError { line: i + 1, message }),
        }
    }
    outcome
}

fn parse_line(line: &[u8], params: &JsonLineParams) -> Result<DecodedRow, String> {
    let value: Value = serde_json::from_slice(line).map_err(|e| format!("cannot parse JSON: {}", e))?;
    let Value::Object(map) = value else {
        return Err("JSON line must be an object".into());
    };

    let time_key = params.time_fields.iter().find(|t| map.contains_key(t.as_str())).cloned();
    let mut timestamp = None;
    let mut fields = Vec::with_capacity(map.len());
    for (key, value) in map {
        if time_key.as_deref() == Some(key.as_str()) {
            timestamp = parse_timestamp(&value).map_err(|e| format!("cannot parse {}: {}", key, e))?;
            continue;
        }
        flatten(&key, &value, 1, &mut fields)?;
    }
    Ok(DecodedRow::new(timestamp, Vec::new(), fields))
}

/// Appends `value` under `prefix`, joining nested object keys with `.`.
/// Arrays render as JSON text; nulls and empty strings are dropped.
pub(crate) fn flatten(prefix: &str, value: &Value, depth: usize, out: &mut Vec<Field>) -> Result<(), String> {
    if depth > MAX_DEPTH {
        return Err(format!("JSON nesting exceeds {} levels", MAX_DEPTH));
    }
    match value {
        Value::Null => {}
        Value::String(s) if s.is_empty() => {}
        Value::String(s) => out.push(Field::new(prefix, s.as_str())),
        Value::Bool(b) => out.push(Field::new(prefix, b.to_string())),
        Value::Number(n) => out.push(Field::new(prefix, n.to_string())),
        Value::Array(_) => {
            check_depth(value, depth)?;
            out.push(Field::new(prefix, value.to_string()));
        }
        Value::Object(map) => {
            for (k, v) in map {
                flatten(&format!("{}.{}", prefix, k), v, depth + 1, out)?;
            }
        }
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize) -> Result<(), String> {
    if depth > MAX_DEPTH {
        return Err(format!("JSON nesting exceeds {} levels", MAX_DEPTH));
    }
    match value {
        Value::Array(items) => items.iter().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Object(map) => map.values().try_for_each(|v| check_depth(v, depth + 1)),
        _ => Ok(()),
    }
}

/// `None` means "use the ingestion time".
fn parse_timestamp(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(unix_integer(i))
            } else {
                n.as_f64().map(unix_float).ok_or_else(|| format!("invalid number {}", n))
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s == "0" {
                return Ok(None);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return dt
                    .timestamp_nanos_opt()
                    .map(Some)
                    .ok_or_else(|| format!("timestamp {:?} is out of range", s));
            }
            if let Ok(i) = s.parse::<i64>() {
                return Ok(unix_integer(i));
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(unix_float(f)),
                _ => Err(format!("unsupported timestamp {:?}", s)),
            }
        }
        other => Err(format!("unsupported timestamp {}", other)),
    }
}

const SECONDS_MAX: i64 = 1 << 32;

/// The magnitude of a unix timestamp decides its unit: seconds,
/// milliseconds, microseconds or nanoseconds.
fn unix_integer(n: i64) -> Option<i64> {
    if n == 0 {
        return None;
    }
    let abs = n.unsigned_abs();
    let nanos = if abs < SECONDS_MAX as u64 {
        n * 1_000_000_000
    } else if abs < SECONDS_MAX as u64 * 1_000 {
        n * 1_000_000
    } else if abs < SECONDS_MAX as u64 * 1_000_000 {
        n * 1_000
    } else {
        n
    };
    Some(nanos)
}

fn unix_float(f: f64) -> Option<i64> {
    if f == 0.0 {
        return None;
    }
    let scale = if f.abs() < SECONDS_MAX as f64 {
        1e9
    } else if f.abs() < SECONDS_MAX as f64 * 1e3 {
        1e6
    } else if f.abs() < SECONDS_MAX as f64 * 1e6 {
        1e3
    } else {
        1.0
    };
    Some((f * scale).round() as i64)
}
