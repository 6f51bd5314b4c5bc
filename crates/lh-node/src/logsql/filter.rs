//! # Filters
//!
//! Filters are evaluated per row. They serialize to JSON so the select side
//! can ship them to storage nodes.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::row::QueryRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    /// `*`
    All,
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
    /// A word or quoted phrase matched at word boundaries. An empty phrase
    /// matches empty or missing fields.
    Phrase { field: String, phrase: String },
    /// `prefix*`; a bare `*` after a field name matches any non-empty value.
    Prefix { field: String, prefix: String },
    /// `field:=value`
    Exact { field: String, value: String },
    /// `field:in(a, b)`
    In { field: String, values: Vec<String> },
    /// `field:~"re"`, unanchored.
    Regex { field: String, regex: Pattern },
    /// `field:>N` and friends. Non-numeric values never match.
    Range { field: String, op: CompareOp, value: f64 },
    /// Inclusive nanosecond range over the row timestamp.
    Time { min: i64, max: i64 },
    /// `_stream:{a="b", c!="d"}`
    Stream { matchers: Vec<StreamMatcher> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
        }
    }
}

/// One label matcher inside `_stream:{...}`.
///
/// Stream tags are stored as ordinary fields too, so matchers read the
/// row's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMatcher {
    pub name: String,
    pub op: StreamOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOp {
    Eq(String),
    Ne(String),
    /// Anchored.
    Re(Pattern),
    NotRe(Pattern),
}

/// A compiled regex that travels as its source text.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Self)
    }

    /// Matches only when the whole value matches.
    pub fn anchored(source: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{})$", source)).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({:?})", self.0.as_str())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Regex::new(&source).map(Self).map_err(serde::de::Error::custom)
    }
}

impl Filter {
    pub fn matches(&self, row: &QueryRow) -> bool {
        match self {
            Self::All => true,
            Self::And { filters } => filters.iter().all(|f| f.matches(row)),
            Self::Or { filters } => filters.iter().any(|f| f.matches(row)),
            Self::Not { filter } => !filter.matches(row),
            Self::Phrase { field, phrase } => {
                let value = row.value(field);
                if phrase.is_empty() {
                    value.is_empty()
                } else {
                    phrase_match(value, phrase, false)
                }
            }
            Self::Prefix { field, prefix } => {
                let value = row.value(field);
                if prefix.is_empty() {
                    !value.is_empty()
                } else {
                    phrase_match(value, prefix, true)
                }
            }
            Self::Exact { field, value } => row.value(field) == value,
            Self::In { field, values } => {
                let v = row.value(field);
                values.iter().any(|x| x == v)
            }
            Self::Regex { field, regex } => regex.is_match(row.value(field)),
            Self::Range { field, op, value } => row
                .get(field)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| v.partial_cmp(value))
                .is_some_and(|ord| op.holds(ord)),
            Self::Time { min, max } => row.timestamp.is_some_and(|ts| ts >= *min && ts <= *max),
            Self::Stream { matchers } => matchers.iter().all(|m| {
                let v = row.value(&m.name);
                match &m.op {
                    StreamOp::Eq(x) => v == x,
                    StreamOp::Ne(x) => v != x,
                    StreamOp::Re(p) => p.is_match(v),
                    StreamOp::NotRe(p) => !p.is_match(v),
                }
            }),
        }
    }

    /// Inclusive time bounds every matching row must fall in.
    pub fn time_range(&self) -> (i64, i64) {
        match self {
            Self::Time { min, max } => (*min, *max),
            Self::And { filters } => filters.iter().fold((i64::MIN, i64::MAX), |(lo, hi), f| {
                let (a, b) = f.time_range();
                (lo.max(a), hi.min(b))
            }),
            _ => (i64::MIN, i64::MAX),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Finds `phrase` in `haystack` so that it does not start or end inside a
/// word. With `prefix` the end may run into a word.
fn phrase_match(haystack: &str, phrase: &str, prefix: bool) -> bool {
    let starts_word = phrase.chars().next().is_some_and(is_word_char);
    let ends_word = phrase.chars().next_back().is_some_and(is_word_char);
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(phrase) {
        let start = from + pos;
        let end = start + phrase.len();
        let left_ok = !starts_word || !haystack[..start].chars().next_back().is_some_and(is_word_char);
        let right_ok = prefix || !ends_word || !haystack[end..].chars().next().is_some_and(is_word_char);
        if left_ok && right_ok {
            return true;
        }
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_core::Field;

    fn row(fields: &[(&str, &str)]) -> QueryRow {
        QueryRow::new(
            Some(100),
            fields.iter().map(|(n, v)| Field::new(*n, *v)).collect(),
        )
    }

    fn phrase(field: &str, p: &str) -> Filter {
        Filter::Phrase {
            field: field.into(),
            phrase: p.into(),
        }
    }

    #[test]
    fn test_word_boundaries() {
        let r = row(&[("_msg", "connection error: timeout_ms exceeded")]);
        assert!(phrase("_msg", "error").matches(&r));
        assert!(phrase("_msg", "timeout_ms").matches(&r));
        assert!(!phrase("_msg", "timeout").matches(&r));
        assert!(!phrase("_msg", "err").matches(&r));
        assert!(phrase("_msg", "error: timeout_ms").matches(&r));
        assert!(phrase("_msg", ":").matches(&r));
    }

    #[test]
    fn test_prefix() {
        let r = row(&[("_msg", "timeout_ms exceeded")]);
        let f = Filter::Prefix {
            field: "_msg".into(),
            prefix: "time".into(),
        };
        assert!(f.matches(&r));
        let any = Filter::Prefix {
            field: "host".into(),
            prefix: String::new(),
        };
        assert!(!any.matches(&r));
    }

    #[test]
    fn test_empty_phrase_matches_missing() {
        let r = row(&[("a", "1")]);
        assert!(phrase("b", "").matches(&r));
        assert!(!phrase("a", "").matches(&r));
    }

    #[test]
    fn test_range_and_time() {
        let r = row(&[("n", "42")]);
        let gt = |v| Filter::Range {
            field: "n".into(),
            op: CompareOp::Gt,
            value: v,
        };
        assert!(gt(41.0).matches(&r));
        assert!(!gt(42.0).matches(&r));
        assert!(!Filter::Range {
            field: "m".into(),
            op: CompareOp::Lt,
            value: 1.0
        }
        .matches(&r));
        assert!(Filter::Time { min: 100, max: 100 }.matches(&r));
        assert!(!Filter::Time { min: 101, max: 200 }.matches(&r));
    }

    #[test]
    fn test_stream_matchers() {
        let r = row(&[("app", "api"), ("env", "prod")]);
        let f = Filter::Stream {
            matchers: vec![
                StreamMatcher {
                    name: "app".into(),
                    op: StreamOp::Eq("api".into()),
                },
                StreamMatcher {
                    name: "env".into(),
                    op: StreamOp::NotRe(Pattern::anchored("dev|stage").unwrap()),
                },
            ],
        };
        assert!(f.matches(&r));
    }

    #[test]
    fn test_json_roundtrip_keeps_regex() {
        let f = Filter::Not {
            filter: Box::new(Filter::Regex {
                field: "_msg".into(),
                regex: Pattern::new("err(or)?").unwrap(),
            }),
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
        assert!(!back.matches(&row(&[("_msg", "an error")])));
    }
}
