//! # `facets` pipe
//!
//! Most frequent values per field. Storage nodes count exact hits per
//! (field, value); the select side sums them and picks the top values.

use std::collections::BTreeMap;

use lh_core::{Field, TIME_FIELD};
use serde::{Deserialize, Serialize};

use super::row::QueryRow;

pub const DEFAULT_LIMIT: u64 = 10;
pub const DEFAULT_MAX_VALUES_PER_FIELD: u64 = 1000;
pub const DEFAULT_MAX_VALUE_LEN: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetsPipe {
    pub limit: u64,
    pub max_values_per_field: u64,
    /// In characters.
    pub max_value_len: u64,
    pub keep_const_fields: bool,
}

impl Default for FacetsPipe {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            max_values_per_field: DEFAULT_MAX_VALUES_PER_FIELD,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            keep_const_fields: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFacets {
    /// Rows seen, for detecting constant fields.
    pub rows: u64,
    pub fields: BTreeMap<String, BTreeMap<String, u64>>,
}

impl PartialFacets {
    pub fn add_row(&mut self, pipe: &FacetsPipe, row: &QueryRow) {
        self.rows += 1;
        for f in &row.fields {
            // Timestamps are practically unique per row.
            if f.value.is_empty() || f.name == TIME_FIELD {
                continue;
            }
            let value = truncate_chars(&f.value, pipe.max_value_len as usize);
            *self
                .fields
                .entry(f.name.clone())
                .or_default()
                .entry(value.to_string())
                .or_default() += 1;
        }
    }

    pub fn merge(&mut self, other: PartialFacets) {
        self.rows += other.rows;
        for (name, values) in other.fields {
            let dst = self.fields.entry(name).or_default();
            for (value, hits) in values {
                *dst.entry(value).or_default() += hits;
            }
        }
    }

    /// Rows of `field_name`, `field_value`, `hits`, fields in name order and
    /// values by descending hits.
    pub fn finalize(&self, pipe: &FacetsPipe) -> Vec<QueryRow> {
        let keep = pipe.limit.min(pipe.max_values_per_field) as usize;
        let mut out = Vec::new();
        for (name, values) in &self.fields {
            if !pipe.keep_const_fields && values.len() == 1 && values.values().all(|&h| h == self.rows) {
                continue;
            }
            let mut top: Vec<(&String, &u64)> = values.iter().collect();
            top.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (value, hits) in top.into_iter().take(keep) {
                out.push(QueryRow::new(
                    None,
                    vec![
                        Field::new("field_name", name.clone()),
                        Field::new("field_value", value.clone()),
                        Field::new("hits", hits.to_string()),
                    ],
                ));
            }
        }
        out
    }
}

/// The first `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row(fields: &[(&str, &str)]) -> QueryRow {
        QueryRow::new(
            None,
            fields.iter().map(|(n, v)| Field::new(*n, *v)).collect(),
        )
    }

    fn hits(rows: &[QueryRow]) -> Vec<(String, String, String)> {
        rows.iter()
            .map(|r| {
                (
                    r.value("field_name").to_string(),
                    r.value("field_value").to_string(),
                    r.value("hits").to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_const_fields_dropped() {
        let pipe = FacetsPipe::default();
        let mut acc = PartialFacets::default();
        acc.add_row(&pipe, &row(&[("app", "api"), ("x", "y")]));
        acc.add_row(&pipe, &row(&[("app", "api"), ("x", "z")]));
        assert_eq!(
            hits(&acc.finalize(&pipe)),
            vec![("x".into(), "y".into(), "1".into()), ("x".into(), "z".into(), "1".into())]
        );

        let keep = FacetsPipe {
            keep_const_fields: true,
            ..FacetsPipe::default()
        };
        assert_eq!(acc.finalize(&keep).len(), 3);
    }

    #[test]
    fn test_field_present_in_some_rows_is_not_const() {
        let pipe = FacetsPipe::default();
        let mut acc = PartialFacets::default();
        acc.add_row(&pipe, &row(&[("a", "1")]));
        acc.add_row(&pipe, &row(&[("b", "2")]));
        assert_eq!(acc.finalize(&pipe).len(), 2);
    }

    #[test]
    fn test_top_values_and_tie_break() {
        let pipe = FacetsPipe {
            limit: 2,
            ..FacetsPipe::default()
        };
        let mut acc = PartialFacets::default();
        for v in ["c", "b", "a", "a", "b", "d"] {
            acc.add_row(&pipe, &row(&[("f", v)]));
        }
        assert_eq!(
            hits(&acc.finalize(&pipe)),
            vec![("f".into(), "a".into(), "2".into()), ("f".into(), "b".into(), "2".into())]
        );
    }

    #[test]
    fn test_long_values_coalesce_after_truncation() {
        let pipe = FacetsPipe {
            max_value_len: 3,
            ..FacetsPipe::default()
        };
        let mut a = PartialFacets::default();
        a.add_row(&pipe, &row(&[("f", "abcdef")]));
        let mut b = PartialFacets::default();
        b.add_row(&pipe, &row(&[("f", "abcxyz")]));
        b.add_row(&pipe, &row(&[("f", "q")]));
        a.merge(b);
        assert_eq!(a.rows, 3);
        assert_eq!(
            hits(&a.finalize(&pipe)),
            vec![("f".into(), "abc".into(), "2".into()), ("f".into(), "q".into(), "1".into())]
        );
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 5), "hi");
    }

    fn facets_of(pipe: &FacetsPipe, rows: &[(u8, u8)]) -> PartialFacets {
        let mut acc = PartialFacets::default();
        for (a, b) in rows {
            let (a, b) = (format!("value-{}", a), b.to_string());
            acc.add_row(pipe, &row(&[("a", a.as_str()), ("b", b.as_str()), ("c", "same")]));
        }
        acc
    }

    proptest! {
        #[test]
        fn prop_sharded_facets_match_single_pass(
            shards in proptest::collection::vec(
                proptest::collection::vec((0u8..6, 0u8..4), 0..15),
                1..5,
            ),
            limit in 1u64..5,
            max_value_len in 1u64..9,
            keep_const_fields in any::<bool>(),
        ) {
            let pipe = FacetsPipe {
                limit,
                max_value_len,
                keep_const_fields,
                ..FacetsPipe::default()
            };
            let all: Vec<(u8, u8)> = shards.iter().flatten().copied().collect();
            let expected = facets_of(&pipe, &all).finalize(&pipe);

            let mut merged = PartialFacets::default();
            for shard in shards.iter().rev() {
                merged.merge(facets_of(&pipe, shard));
            }
            prop_assert_eq!(merged.finalize(&pipe), expected);
        }
    }
}
