//! # Pipes
//!
//! Row transformations after the filter. `filter` and `fields` look at one
//! row at a time and can run on storage nodes; the rest need the whole
//! result.

use std::cmp::Ordering;

use lh_core::TIME_FIELD;
use serde::{Deserialize, Serialize};

use super::facets::{FacetsPipe, PartialFacets};
use super::filter::Filter;
use super::row::QueryRow;
use super::stats::{PartialStats, StatsPipe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pipe", rename_all = "snake_case")]
pub enum Pipe {
    Filter { filter: Filter },
    Fields { fields: Vec<String> },
    Limit { limit: u64 },
    Sort(SortPipe),
    Stats(StatsPipe),
    Facets(FacetsPipe),
}

impl Pipe {
    /// Whether the pipe transforms rows independently of each other.
    pub fn is_row_local(&self) -> bool {
        matches!(self, Self::Filter { .. } | Self::Fields { .. })
    }

    /// Applies a row-local pipe to one row. `None` drops the row.
    pub fn apply_row(&self, row: QueryRow) -> Option<QueryRow> {
        match self {
            Self::Filter { filter } => filter.matches(&row).then_some(row),
            Self::Fields { fields } => Some(row.project(fields)),
            _ => Some(row),
        }
    }

    pub fn apply(&self, mut rows: Vec<QueryRow>) -> Vec<QueryRow> {
        match self {
            Self::Filter { .. } | Self::Fields { .. } => rows.into_iter().filter_map(|r| self.apply_row(r)).collect(),
            Self::Limit { limit } => {
                rows.truncate(*limit as usize);
                rows
            }
            Self::Sort(sort) => sort.apply(rows),
            Self::Stats(stats) => {
                let mut acc = PartialStats::default();
                for row in &rows {
                    acc.add_row(stats, row);
                }
                acc.finalize(stats)
            }
            Self::Facets(facets) => {
                let mut acc = PartialFacets::default();
                for row in &rows {
                    acc.add_row(facets, row);
                }
                acc.finalize(facets)
            }
        }
    }
}

pub fn apply_pipes(rows: Vec<QueryRow>, pipes: &[Pipe]) -> Vec<QueryRow> {
    pipes.iter().fold(rows, |rows, pipe| pipe.apply(rows))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub desc: bool,
}

/// `sort by (f1 [desc], f2) [desc] [limit N]`. Without keys rows sort by
/// `_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortPipe {
    pub keys: Vec<SortKey>,
    pub desc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl SortPipe {
    /// Numbers compare numerically, everything else as text; `_time` uses
    /// row timestamps when both rows carry one.
    pub fn compare(&self, a: &QueryRow, b: &QueryRow) -> Ordering {
        let time_key = [SortKey {
            field: TIME_FIELD.into(),
            desc: false,
        }];
        let keys: &[SortKey] = if self.keys.is_empty() { &time_key } else { &self.keys };
        for key in keys {
            let mut ord = compare_field(a, b, &key.field);
            if key.desc {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return if self.desc { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    }

    pub fn apply(&self, mut rows: Vec<QueryRow>) -> Vec<QueryRow> {
        rows.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            rows.truncate(limit as usize);
        }
        rows
    }
}

fn compare_field(a: &QueryRow, b: &QueryRow, field: &str) -> Ordering {
    if field == TIME_FIELD {
        if let (Some(x), Some(y)) = (a.timestamp, b.timestamp) {
            return x.cmp(&y);
        }
    }
    let (x, y) = (a.value(field), b.value(field));
    match (x.parse::<f64>(), y.parse::<f64>()) {
        (Ok(nx), Ok(ny)) => nx.partial_cmp(&ny).unwrap_or(Ordering::Equal),
        _ => x.cmp(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_core::Field;

    fn row(ts: i64, fields: &[(&str, &str)]) -> QueryRow {
        QueryRow::new(
            Some(ts),
            fields.iter().map(|(n, v)| Field::new(*n, *v)).collect(),
        )
    }

    #[test]
    fn test_sort_numeric_then_text() {
        let sort = SortPipe {
            keys: vec![SortKey {
                field: "n".into(),
                desc: true,
            }],
            desc: false,
            limit: Some(2),
        };
        let rows = vec![row(1, &[("n", "9")]), row(2, &[("n", "10")]), row(3, &[("n", "2")])];
        let out = sort.apply(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value("n"), "10");
        assert_eq!(out[1].value("n"), "9");
    }

    #[test]
    fn test_sort_defaults_to_time() {
        let sort = SortPipe {
            keys: vec![],
            desc: true,
            limit: None,
        };
        let out = sort.apply(vec![row(1, &[]), row(3, &[]), row(2, &[])]);
        let ts: Vec<_> = out.iter().map(|r| r.timestamp.unwrap()).collect();
        assert_eq!(ts, vec![3, 2, 1]);
    }

    #[test]
    fn test_apply_pipes_chain() {
        let rows = vec![
            row(1, &[("a", "1"), ("b", "x")]),
            row(2, &[("a", "2"), ("b", "y")]),
            row(3, &[("a", "3"), ("b", "x")]),
        ];
        let pipes = vec![
            Pipe::Filter {
                filter: Filter::Exact {
                    field: "b".into(),
                    value: "x".into(),
                },
            },
            Pipe::Fields {
                fields: vec!["a".into()],
            },
            Pipe::Limit { limit: 1 },
        ];
        let out = apply_pipes(rows, &pipes);
        assert_eq!(out, vec![QueryRow::new(None, vec![Field::new("a", "1")])]);
    }

    #[test]
    fn test_row_local_classification() {
        assert!(Pipe::Fields { fields: vec![] }.is_row_local());
        assert!(!Pipe::Limit { limit: 1 }.is_row_local());
        assert!(!Pipe::Facets(FacetsPipe::default()).is_row_local());
    }
}
