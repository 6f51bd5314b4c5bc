//! # Rows
//!
//! The canonical row and the two shapes it takes on its way to storage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stream::{StreamId, StreamTags};
use crate::MSG_FIELD;

/// A single `(name, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The canonical row every decoder converges to.
///
/// No validation happens here: an empty field list is a legal (empty) log
/// line and is stored like any other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub fields: Vec<Field>,
}

impl LogRow {
    pub fn new(timestamp: i64, fields: Vec<Field>) -> Self {
        Self { timestamp, fields }
    }

    /// Value of the last field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        find_last(&self.fields, name)
    }
}

/// Decoder output.
///
/// Stream fields travel in their own group, so no caller has to trust a
/// positional prefix length. `timestamp` is `None` when the payload carried
/// no usable time; the classifier substitutes the ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRow {
    pub timestamp: Option<i64>,
    pub stream_fields: Vec<Field>,
    pub other_fields: Vec<Field>,
}

impl DecodedRow {
    pub fn new(timestamp: Option<i64>, stream_fields: Vec<Field>, other_fields: Vec<Field>) -> Self {
        Self {
            timestamp,
            stream_fields,
            other_fields,
        }
    }

    /// Builds a row from the positional convention where the leading
    /// `stream_fields_len` fields are stream fields.
    ///
    /// `stream_fields_len` is clamped to `fields.len()`.
    pub fn from_positional(timestamp: Option<i64>, mut fields: Vec<Field>, stream_fields_len: usize) -> Self {
        let split = stream_fields_len.min(fields.len());
        let other_fields = fields.split_off(split);
        Self {
            timestamp,
            stream_fields: fields,
            other_fields,
        }
    }

    /// Number of stream fields, i.e. the length of the leading group in the
    /// positional representation.
    pub fn stream_fields_len(&self) -> usize {
        self.stream_fields.len()
    }

    /// All fields with the stream group first.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.stream_fields.iter().chain(self.other_fields.iter())
    }
}

/// A classified row ready for storage.
///
/// The stream tags and their id are fixed at construction and only exposed
/// through accessors. `fields` always holds the stream fields too, plus a
/// `_msg` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub timestamp: i64,
    pub fields: Vec<Field>,
    stream: StreamTags,
    stream_id: StreamId,
}

impl StoredRow {
    pub fn new(timestamp: i64, stream: StreamTags, fields: Vec<Field>) -> Self {
        let stream_id = stream.id();
        Self {
            timestamp,
            fields,
            stream,
            stream_id,
        }
    }

    pub fn stream(&self) -> &StreamTags {
        &self.stream
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        find_last(&self.fields, name)
    }

    /// The message of this row; empty when the row was stored without one.
    pub fn message(&self) -> &str {
        self.get(MSG_FIELD).unwrap_or_default()
    }

    /// Rebuilds a stored row from its decoder shape: the stream group becomes
    /// the stream tags and is stored as ordinary fields too.
    pub fn from_decoded(row: DecodedRow, default_timestamp: i64) -> Self {
        let stream = StreamTags::new(row.stream_fields.iter().cloned());
        let mut fields = row.stream_fields;
        fields.extend(row.other_fields);
        Self::new(row.timestamp.unwrap_or(default_timestamp), stream, dedup_fields(fields))
    }

    /// Splits the row back into the decoder shape: stream tags as the stream
    /// group, remaining fields (minus exact duplicates of a tag) as the rest.
    pub fn to_decoded(&self) -> DecodedRow {
        let stream_fields = self.stream.tags().to_vec();
        let other_fields = self
            .fields
            .iter()
            .filter(|f| !stream_fields.contains(f))
            .cloned()
            .collect();
        DecodedRow::new(Some(self.timestamp), stream_fields, other_fields)
    }
}

/// Resolves duplicate names: the value of the last occurrence wins, the
/// position of the first occurrence is kept.
pub fn dedup_fields(fields: Vec<Field>) -> Vec<Field> {
    let mut out: Vec<Field> = Vec::with_capacity(fields.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(fields.len());
    for field in fields {
        match index.get(&field.name) {
            Some(&i) => out[i].value = field.value,
            None => {
                index.insert(field.name.clone(), out.len());
                out.push(field);
            }
        }
    }
    out
}

fn find_last<'a>(fields: &'a [Field], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .rev()
        .find(|f| f.name == name)
        .map(|f| f.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str, value: &str) -> Field {
        Field::new(name, value)
    }

    #[test]
    fn test_empty_row_is_legal() {
        let row = LogRow::new(42, Vec::new());
        assert_eq!(row.timestamp, 42);
        assert!(row.fields.is_empty());
        assert_eq!(row.get("_msg"), None);
    }

    #[test]
    fn test_dedup_last_write_wins_keeps_first_position() {
        let fields = vec![f("a", "1"), f("b", "2"), f("a", "3")];
        assert_eq!(dedup_fields(fields), vec![f("a", "3"), f("b", "2")]);
    }

    #[test]
    fn test_from_positional_splits_leading_group() {
        let row = DecodedRow::from_positional(None, vec![f("host", "h1"), f("x", "y"), f("_msg", "m")], 1);
        assert_eq!(row.stream_fields, vec![f("host", "h1")]);
        assert_eq!(row.other_fields, vec![f("x", "y"), f("_msg", "m")]);
        assert_eq!(row.stream_fields_len(), 1);
    }

    #[test]
    fn test_from_positional_clamps_length() {
        let row = DecodedRow::from_positional(None, vec![f("a", "1")], 5);
        assert_eq!(row.stream_fields_len(), 1);
        assert!(row.other_fields.is_empty());
    }

    #[test]
    fn test_stored_row_to_decoded_moves_tags_first() {
        let stream = StreamTags::new(vec![f("x", "y")]);
        let row = StoredRow::new(7, stream, vec![f("_msg", "hello"), f("x", "y"), f("z", "1")]);
        let decoded = row.to_decoded();
        assert_eq!(decoded.timestamp, Some(7));
        assert_eq!(decoded.stream_fields, vec![f("x", "y")]);
        assert_eq!(decoded.other_fields, vec![f("_msg", "hello"), f("z", "1")]);
        assert_eq!(row.message(), "hello");

        let restored = StoredRow::from_decoded(decoded, 0);
        assert_eq!(restored.stream_id(), row.stream_id());
        assert_eq!(restored.get("x"), Some("y"));
        assert_eq!(restored.get("z"), Some("1"));
        assert_eq!(restored.timestamp, 7);
    }
}
