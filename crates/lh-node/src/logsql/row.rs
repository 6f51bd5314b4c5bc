//! Rows as queries see them.

use lh_core::{Field, StoredRow, MSG_FIELD, STREAM_FIELD, STREAM_ID_FIELD, TIME_FIELD};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::time::format_time;

/// A row flowing through filters and pipes.
///
/// `timestamp` rides alongside the rendered `_time` field so sorting and
/// time bucketing never reparse text. Pipes that produce new rows (stats,
/// facets) set it only when the row has a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub fields: Vec<Field>,
}

impl QueryRow {
    pub fn new(timestamp: Option<i64>, fields: Vec<Field>) -> Self {
        Self { timestamp, fields }
    }

    /// Expands a stored row with the computed `_time`, `_stream_id` and
    /// `_stream` fields, in that order, followed by `_msg` and the rest.
    pub fn from_stored(row: &StoredRow) -> Self {
        let mut fields = Vec::with_capacity(row.fields.len() + 3);
        fields.push(Field::new(TIME_FIELD, format_time(row.timestamp)));
        fields.push(Field::new(STREAM_ID_FIELD, row.stream_id().to_string()));
        fields.push(Field::new(STREAM_FIELD, row.stream().canonical()));
        fields.push(Field::new(MSG_FIELD, row.message()));
        fields.extend(row.fields.iter().filter(|f| f.name != MSG_FIELD).cloned());
        Self {
            timestamp: Some(row.timestamp),
            fields,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// Value of `name`; missing fields read as empty.
    pub fn value(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(f) => f.value = value,
            None => self.fields.push(Field::new(name, value)),
        }
    }

    /// Keeps only `names`, in the order given. Missing names are skipped.
    pub fn project(mut self, names: &[String]) -> Self {
        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            if let Some(i) = self.fields.iter().position(|f| &f.name == name) {
                fields.push(self.fields.swap_remove(i));
            }
        }
        if !names.iter().any(|n| n == TIME_FIELD) {
            self.timestamp = None;
        }
        Self {
            timestamp: self.timestamp,
            fields,
        }
    }

    /// The row as one JSON object with fields in row order.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(&JsonObject(&self.fields)).unwrap_or_else(|_| "{}".into())
    }
}

struct JsonObject<'a>(&'a [Field]);

impl Serialize for JsonObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for f in self.0 {
            map.serialize_entry(&f.name, &f.value)?;
        }
        map.end()
    }
}
