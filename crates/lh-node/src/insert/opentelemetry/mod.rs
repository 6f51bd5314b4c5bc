//! # OpenTelemetry logs decoder
//!
//! One row per `LogRecord`. Resource attributes form the stream; record
//! attributes, scope, trace context, severity and finally the body become
//! ordinary fields. The whole request is decoded before any row is produced.

pub mod pb;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lh_core::{DecodedRow, Field, MSG_FIELD};
use prost::Message;

use pb::any_value::Value;
use pb::{AnyValue, KeyValue, LogRecord, LogsData};

pub fn decode(data: &[u8]) -> Result<Vec<DecodedRow>, prost::DecodeError> {
    let logs = LogsData::decode(data)?;
    let mut rows = Vec::new();
    for rl in &logs.resource_logs {
        let mut stream_fields = Vec::new();
        if let Some(resource) = &rl.resource {
            flatten_attributes("", &resource.attributes, &mut stream_fields);
        }
        for sl in &rl.scope_logs {
            let mut scope_fields = Vec::new();
            if let Some(scope) = &sl.scope {
                if !scope.name.is_empty() {
                    scope_fields.push(Field::new("scope.name", scope.name.as_str()));
                }
                if !scope.version.is_empty() {
                    scope_fields.push(Field::new("scope.version", scope.version.as_str()));
                }
            }
            for record in &sl.log_records {
                rows.push(decode_record(record, &stream_fields, &scope_fields));
            }
        }
    }
    Ok(rows)
}

fn decode_record(record: &LogRecord, stream_fields: &[Field], scope_fields: &[Field]) -> DecodedRow {
    let mut fields = Vec::with_capacity(record.attributes.len() + scope_fields.len() + 4);

    flatten_attributes("", &record.attributes, &mut fields);
    fields.extend_from_slice(scope_fields);
    if !record.trace_id.is_empty() {
        fields.push(Field::new("trace_id", hex(&record.trace_id)));
    }
    if !record.span_id.is_empty() {
        fields.push(Field::new("span_id", hex(&record.span_id)));
    }
    let severity = if record.severity_text.is_empty() {
        severity_name(record.severity_number)
    } else {
        record.severity_text.clone()
    };
    fields.push(Field::new("severity", severity));

    // The body goes last so it wins over same-named attributes.
    match record.body.as_ref().and_then(|b| b.value.as_ref()) {
        Some(Value::KvlistValue(list)) => flatten_attributes("", &list.values, &mut fields),
        Some(v) => {
            let text = format_value(v);
            if !text.is_empty() {
                fields.push(Field::new(MSG_FIELD, text));
            }
        }
        None => {}
    }

    let timestamp = [record.time_unix_nano, record.observed_time_unix_nano]
        .into_iter()
        .find(|&t| t != 0)
        .map(|t| t.min(i64::MAX as u64) as i64);

    DecodedRow::new(timestamp, stream_fields.to_vec(), fields)
}

/// Nested key/value lists join their keys with `.`. Empty values are dropped.
fn flatten_attributes(prefix: &str, attrs: &[KeyValue], out: &mut Vec<Field>) {
    for kv in attrs {
        let name = if prefix.is_empty() {
            kv.key.clone()
        } else {
            format!("{}.{}", prefix, kv.key)
        };
        match kv.value.as_ref().and_then(|v| v.value.as_ref()) {
            Some(Value::KvlistValue(list)) => flatten_attributes(&name, &list.values, out),
            Some(v) => {
                let text = format_value(v);
                if !text.is_empty() {
                    out.push(Field::new(name, text));
                }
            }
            None => {}
        }
    }
}

fn format_value(v: &Value) -> String {
    match v {
        Value::StringValue(s) => s.clone(),
        Value::BoolValue(b) => b.to_string(),
        Value::IntValue(i) => i.to_string(),
        Value::DoubleValue(d) => d.to_string(),
        Value::BytesValue(b) => STANDARD.encode(b),
        Value::ArrayValue(_) | Value::KvlistValue(_) => to_json(v).to_string(),
    }
}

fn to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::StringValue(s) => s.clone().into(),
        Value::BoolValue(b) => (*b).into(),
        Value::IntValue(i) => (*i).into(),
        Value::DoubleValue(d) => serde_json::Number::from_f64(*d).map_or_else(|| d.to_string().into(), Into::into),
        Value::BytesValue(b) => STANDARD.encode(b).into(),
        Value::ArrayValue(arr) => arr.values.iter().map(any_to_json).collect::<Vec<_>>().into(),
        Value::KvlistValue(list) => list
            .values
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.as_ref().map_or(serde_json::Value::Null, any_to_json)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
    }
}

fn any_to_json(v: &AnyValue) -> serde_json::Value {
    v.value.as_ref().map_or(serde_json::Value::Null, to_json)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Text for an OTLP `SeverityNumber`.
pub fn severity_name(n: i32) -> String {
    const NAMES: [&str; 6] = ["Trace", "Debug", "Info", "Warn", "Error", "Fatal"];
    if !(1..=24).contains(&n) {
        return "Unspecified".into();
    }
    let base = NAMES[((n - 1) / 4) as usize];
    match (n - 1) % 4 {
        0 => base.to_string(),
        k => format!("{}{}", base, k + 1),
    }
}
