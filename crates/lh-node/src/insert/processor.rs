//! # Field classifier
//!
//! Turns decoder output into rows ready for storage: picks the message
//! field, builds the stream, applies the per-request field overrides and
//! fills in the timestamp. Classification never fails.

use lh_core::{dedup_fields, is_reserved_field, DecodedRow, Field, StoredRow, StreamTags, MSG_FIELD};

/// Per-request classification settings, taken from the ingestion query args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyParams {
    /// Candidate message field names in priority order.
    pub msg_fields: Vec<String>,
    /// `None` keeps the stream fields the decoder produced.
    pub stream_fields: Option<Vec<String>>,
    pub ignore_fields: Vec<String>,
    pub extra_fields: Vec<Field>,
}

impl Default for ClassifyParams {
    fn default() -> Self {
        Self {
            msg_fields: vec![MSG_FIELD.to_string()],
            stream_fields: None,
            ignore_fields: Vec::new(),
            extra_fields: Vec::new(),
        }
    }
}

impl ClassifyParams {
    pub fn use_default_stream_fields(&self) -> bool {
        self.stream_fields.is_none()
    }
}

/// Classifies one decoded row. `now` is used when the row carries no time.
pub fn process(row: DecodedRow, params: &ClassifyParams, now: i64) -> StoredRow {
    let DecodedRow {
        timestamp,
        stream_fields,
        mut other_fields,
    } = row;

    rename_msg_field(&mut other_fields, &params.msg_fields);

    let mut fields = Vec::with_capacity(stream_fields.len() + other_fields.len() + params.extra_fields.len() + 1);
    fields.extend(stream_fields.iter().cloned());
    fields.extend(other_fields);

    for extra in &params.extra_fields {
        match fields.iter_mut().find(|f| f.name == extra.name) {
            Some(f) => f.value = extra.value.clone(),
            None => fields.push(extra.clone()),
        }
    }

    fields.retain(|f| keep_field(f, params));
    let mut fields = dedup_fields(fields);
    if !fields.iter().any(|f| f.name == MSG_FIELD) {
        fields.push(Field::new(MSG_FIELD, ""));
    }

    let stream = match &params.stream_fields {
        None => StreamTags::new(stream_fields.into_iter().filter(|f| keep_field(f, params))),
        Some(names) => StreamTags::new(
            fields
                .iter()
                .filter(|f| names.iter().any(|n| *n == f.name))
                .cloned(),
        ),
    };

    StoredRow::new(timestamp.unwrap_or(now), stream, fields)
}

/// Reserved names, ignored names and empty values other than `_msg` are
/// dropped from both the fields and the stream.
fn keep_field(f: &Field, params: &ClassifyParams) -> bool {
    !is_reserved_field(&f.name)
        && !params.ignore_fields.iter().any(|n| *n == f.name)
        && (f.name == MSG_FIELD || !f.value.is_empty())
}

/// Renames the first field carrying the highest-priority candidate name.
fn rename_msg_field(fields: &mut [Field], candidates: &[String]) {
    for name in candidates {
        if let Some(f) = fields.iter_mut().find(|f| f.name == *name) {
            if f.name != MSG_FIELD {
                f.name = MSG_FIELD.to_string();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str, value: &str) -> Field {
        Field::new(name, value)
    }

    fn names(row: &StoredRow) -> Vec<&str> {
        row.fields.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_msg_field_priority() {
        let params = ClassifyParams {
            msg_fields: vec!["message".into(), "log".into()],
            ..Default::default()
        };
        let row = DecodedRow::new(Some(5), vec![], vec![f("log", "a"), f("message", "b"), f("message", "c")]);
        let out = process(row, &params, 0);
        assert_eq!(out.message(), "b");
        assert_eq!(out.get("log"), Some("a"));
        assert_eq!(out.get("message"), Some("c"));
        assert_eq!(out.timestamp, 5);
    }

    #[test]
    fn test_missing_msg_becomes_empty() {
        let out = process(DecodedRow::new(None, vec![], vec![f("a", "1")]), &ClassifyParams::default(), 77);
        assert_eq!(out.get(MSG_FIELD), Some(""));
        assert_eq!(out.timestamp, 77);
        assert!(out.stream().is_empty());
    }

    #[test]
    fn test_default_stream_uses_decoder_group() {
        let row = DecodedRow::new(
            Some(1),
            vec![f("service", "api"), f("host", "h1")],
            vec![f("_msg", "hi"), f("level", "info")],
        );
        let out = process(row, &ClassifyParams::default(), 0);
        assert_eq!(out.stream().canonical(), r#"{host="h1",service="api"}"#);
        assert_eq!(names(&out), vec!["service", "host", "_msg", "level"]);
    }

    #[test]
    fn test_ignored_fields_leave_default_stream() {
        let params = ClassifyParams {
            ignore_fields: vec!["host".into()],
            ..Default::default()
        };
        let row = DecodedRow::new(
            Some(1),
            vec![f("service", "api"), f("host", "h1"), f("_stream_id", "x")],
            vec![f("_msg", "hi")],
        );
        let out = process(row, &params, 0);
        assert_eq!(out.stream().canonical(), r#"{service="api"}"#);
        assert_eq!(out.get("host"), None);
    }

    #[test]
    fn test_explicit_stream_fields_demote_decoder_group() {
        let params = ClassifyParams {
            stream_fields: Some(vec!["level".into(), "missing".into()]),
            ..Default::default()
        };
        let row = DecodedRow::new(Some(1), vec![f("service", "api")], vec![f("_msg", "hi"), f("level", "warn")]);
        let out = process(row, &params, 0);
        assert_eq!(out.stream().canonical(), r#"{level="warn"}"#);
        assert_eq!(out.get("service"), Some("api"));
    }

    #[test]
    fn test_extra_ignore_reserved_and_empty() {
        let params = ClassifyParams {
            ignore_fields: vec!["secret".into()],
            extra_fields: vec![f("env", "prod"), f("level", "error")],
            ..Default::default()
        };
        let row = DecodedRow::new(
            None,
            vec![],
            vec![
                f("_msg", ""),
                f("level", "info"),
                f("secret", "x"),
                f("_stream", "{}"),
                f("_time", "123"),
                f("empty", ""),
                f("a", "1"),
                f("a", "2"),
            ],
        );
        let out = process(row, &params, 9);
        assert_eq!(names(&out), vec!["_msg", "level", "a", "env"]);
        assert_eq!(out.get("level"), Some("error"));
        assert_eq!(out.get("a"), Some("2"));
        assert_eq!(out.message(), "");
    }

    #[test]
    fn test_identical_streams_share_id() {
        let p = ClassifyParams::default();
        let a = process(DecodedRow::new(None, vec![f("x", "1"), f("y", "2")], vec![]), &p, 0);
        let b = process(DecodedRow::new(None, vec![f("y", "2"), f("x", "1")], vec![]), &p, 0);
        assert_eq!(a.stream_id(), b.stream_id());
    }
}
