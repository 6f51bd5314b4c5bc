//! # Query plan
//!
//! A query splits into a remote part that every shard runs against its own
//! rows (the filter, the leading row-local pipes and the first pipe that
//! needs the whole result) and a local part the select node runs over the
//! merged rows.

use std::cmp::Ordering;
use std::collections::VecDeque;

use lh_store::Storage;
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::logsql::{Filter, PartialFacets, PartialStats, Pipe, Query, QueryRow, SortPipe};

/// The part of a query a storage node executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteQuery {
    pub filter: Filter,
    /// Row-local pipes only.
    pub pipes: Vec<Pipe>,
    /// The first pipe that needs every row: `limit`, `sort`, `stats` or
    /// `facets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Pipe>,
    pub min_ts: i64,
    pub max_ts: i64,
}

/// What a shard sends back: the same shape the final result has, so the
/// merge only combines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PartialResult {
    Rows(Vec<QueryRow>),
    Stats(PartialStats),
    Facets(PartialFacets),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub remote: RemoteQuery,
    pub local: Vec<Pipe>,
}

pub fn split(query: Query) -> Plan {
    let (min_ts, max_ts) = query.time_range();
    let mut pipes = query.pipes.into_iter().peekable();

    let mut remote_pipes = Vec::new();
    while let Some(p) = pipes.next_if(Pipe::is_row_local) {
        remote_pipes.push(p);
    }

    let mut terminal = pipes.next();
    let mut local = Vec::new();
    match &mut terminal {
        // Each shard stops at the limit; the select node applies it again
        // over the concatenation.
        Some(p @ Pipe::Limit { .. }) => local.push(p.clone()),
        // `sort | limit N` lets every shard keep only its first N rows.
        Some(Pipe::Sort(sort)) => {
            if let Some(Pipe::Limit { limit }) = pipes.peek() {
                sort.limit = Some(sort.limit.map_or(*limit, |l| l.min(*limit)));
            }
        }
        _ => {}
    }
    local.extend(pipes);

    Plan {
        remote: RemoteQuery {
            filter: query.filter,
            pipes: remote_pipes,
            terminal,
            min_ts,
            max_ts,
        },
        local,
    }
}

/// Runs the remote part against a local storage.
pub fn execute(storage: &Storage, q: &RemoteQuery) -> PartialResult {
    let limit = match &q.terminal {
        Some(Pipe::Limit { limit }) => Some(*limit as usize),
        _ => None,
    };
    let mut rows = Vec::new();
    let mut stats = PartialStats::default();
    let mut facets = PartialFacets::default();

    storage.search(q.min_ts, q.max_ts, |stored| {
        if limit.is_some_and(|l| rows.len() >= l) {
            return;
        }
        let row = QueryRow::from_stored(stored);
        if !q.filter.matches(&row) {
            return;
        }
        let Some(row) = q.pipes.iter().try_fold(row, |r, p| p.apply_row(r)) else {
            return;
        };
        match &q.terminal {
            Some(Pipe::Stats(s)) => stats.add_row(s, &row),
            Some(Pipe::Facets(f)) => facets.add_row(f, &row),
            _ => rows.push(row),
        }
    });

    match &q.terminal {
        Some(Pipe::Stats(_)) => PartialResult::Stats(stats),
        Some(Pipe::Facets(_)) => PartialResult::Facets(facets),
        Some(Pipe::Sort(s)) => PartialResult::Rows(s.apply(rows)),
        _ => PartialResult::Rows(rows),
    }
}

/// Combines per-shard results into rows for the local pipes. A partial of
/// the wrong shape fails the whole merge.
pub fn merge(terminal: Option<&Pipe>, partials: Vec<PartialResult>) -> Result<Vec<QueryRow>, MergeError> {
    match terminal {
        Some(Pipe::Stats(pipe)) => {
            let mut acc = PartialStats::default();
            for p in partials {
                match p {
                    PartialResult::Stats(s) => acc.merge(s)?,
                    other => return Err(other.mismatch("stats")),
                }
            }
            Ok(acc.finalize(pipe))
        }
        Some(Pipe::Facets(pipe)) => {
            let mut acc = PartialFacets::default();
            for p in partials {
                match p {
                    PartialResult::Facets(f) => acc.merge(f),
                    other => return Err(other.mismatch("facets")),
                }
            }
            Ok(acc.finalize(pipe))
        }
        Some(Pipe::Sort(sort)) => Ok(merge_sorted(rows_of(partials)?, sort)),
        _ => Ok(rows_of(partials)?.into_iter().flatten().collect()),
    }
}

impl PartialResult {
    fn kind(&self) -> &'static str {
        match self {
            Self::Rows(_) => "rows",
            Self::Stats(_) => "stats",
            Self::Facets(_) => "facets",
        }
    }

    fn mismatch(&self, want: &'static str) -> MergeError {
        MergeError::Kind { want, got: self.kind() }
    }
}

fn rows_of(partials: Vec<PartialResult>) -> Result<Vec<Vec<QueryRow>>, MergeError> {
    partials
        .into_iter()
        .map(|p| match p {
            PartialResult::Rows(rows) => Ok(rows),
            other => Err(other.mismatch("rows")),
        })
        .collect()
}

/// K-way merge of lists already sorted by `sort`. Ties go to the earlier
/// list, so each shard's own order is kept.
pub fn merge_sorted(lists: Vec<Vec<QueryRow>>, sort: &SortPipe) -> Vec<QueryRow> {
    let limit = sort.limit.map_or(usize::MAX, |l| l as usize);
    let mut queues: Vec<VecDeque<QueryRow>> = lists.into_iter().map(VecDeque::from).collect();
    let mut out = Vec::with_capacity(queues.iter().map(VecDeque::len).sum::<usize>().min(limit));
    while out.len() < limit {
        let mut best: Option<(usize, &QueryRow)> = None;
        for (i, q) in queues.iter().enumerate() {
            if let Some(head) = q.front() {
                match best {
                    Some((_, b)) if sort.compare(b, head) != Ordering::Greater => {}
                    _ => best = Some((i, head)),
                }
            }
        }
        let Some((i, _)) = best else {
            break;
        };
        if let Some(row) = queues[i].pop_front() {
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsql::SortKey;
    use lh_core::{Field, StoredRow, StreamTags};
    use lh_store::StorageConfig;

    fn plan(text: &str) -> Plan {
        split(Query::parse(text, 0).unwrap())
    }

    #[test]
    fn test_split_row_local_prefix() {
        let p = plan("error | fields _msg | filter x | stats count() | limit 1");
        assert_eq!(p.remote.pipes.len(), 2);
        assert!(matches!(p.remote.terminal, Some(Pipe::Stats(_))));
        assert_eq!(p.local, vec![Pipe::Limit { limit: 1 }]);
    }

    #[test]
    fn test_split_limit_reapplied_locally() {
        let p = plan("* | limit 5 | fields a");
        assert_eq!(p.remote.terminal, Some(Pipe::Limit { limit: 5 }));
        assert_eq!(p.local.len(), 2);
        assert_eq!(p.local[0], Pipe::Limit { limit: 5 });
    }

    #[test]
    fn test_split_sort_limit_pushdown() {
        let p = plan("* | sort by (_time) desc | limit 3");
        let Some(Pipe::Sort(sort)) = &p.remote.terminal else {
            panic!("expected sort");
        };
        assert_eq!(sort.limit, Some(3));
        assert_eq!(p.local, vec![Pipe::Limit { limit: 3 }]);
    }

    #[test]
    fn test_split_carries_time_range() {
        let p = plan("_time:>=1970-01-01T00:00:01Z foo");
        assert_eq!(p.remote.min_ts, 1_000_000_000);
        assert_eq!(p.remote.max_ts, i64::MAX);
    }

    #[test]
    fn test_merge_sorted_is_stable_and_limited() {
        let r = |ts: i64, node: &str| QueryRow::new(Some(ts), vec![Field::new("node", node)]);
        let sort = SortPipe {
            keys: vec![SortKey {
                field: "_time".into(),
                desc: false,
            }],
            desc: false,
            limit: Some(4),
        };
        let out = merge_sorted(
            vec![vec![r(1, "a"), r(3, "a")], vec![r(1, "b"), r(2, "b"), r(5, "b")]],
            &sort,
        );
        let got: Vec<(i64, &str)> = out.iter().map(|x| (x.timestamp.unwrap(), x.value("node"))).collect();
        assert_eq!(got, vec![(1, "a"), (1, "b"), (2, "b"), (3, "a")]);
    }

    #[test]
    fn test_execute_against_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path())).unwrap();
        let now = lh_core::now_nanos();
        let rows = (0..5)
            .map(|i| {
                let x = if i == 0 { "z" } else { "y" };
                StoredRow::new(
                    now + i,
                    StreamTags::new(vec![Field::new("x", x)]),
                    vec![Field::new("x", x), Field::new("_msg", format!("m{}", i))],
                )
            })
            .collect();
        storage.add_rows(rows).unwrap();
        storage.force_flush();

        let p = plan("x:=y | stats count() as n");
        let partial = execute(&storage, &p.remote);
        let merged = merge(p.remote.terminal.as_ref(), vec![partial.clone(), partial.clone()]).unwrap();
        assert_eq!(merged[0].value("n"), "8");

        let rows = PartialResult::Rows(vec![QueryRow::new(Some(now), vec![Field::new("x", "y")])]);
        assert_eq!(
            merge(p.remote.terminal.as_ref(), vec![partial.clone(), rows]),
            Err(MergeError::Kind { want: "stats", got: "rows" })
        );
        assert_eq!(
            merge(None, vec![partial]),
            Err(MergeError::Kind { want: "rows", got: "stats" })
        );

        let p = plan("* | limit 2");
        let PartialResult::Rows(rows) = execute(&storage, &p.remote) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_mismatched_stats_state_fails_merge() {
        let count = plan("* | stats by (x) count() as n");
        let sum = plan("* | stats by (x) sum(v) as n");
        let row = QueryRow::new(Some(1), vec![Field::new("x", "a"), Field::new("v", "2")]);
        let partial = |p: &Plan| {
            let Some(Pipe::Stats(s)) = &p.remote.terminal else {
                panic!("expected stats");
            };
            let mut acc = PartialStats::default();
            acc.add_row(s, &row);
            PartialResult::Stats(acc)
        };
        let err = merge(count.remote.terminal.as_ref(), vec![partial(&count), partial(&sum)]).unwrap_err();
        assert_eq!(err, MergeError::State { want: "count", got: "sum" });
    }

    #[test]
    fn test_partial_wire_format() {
        let p = PartialResult::Rows(vec![QueryRow::new(Some(1), vec![Field::new("a", "b")])]);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.starts_with(r#"{"kind":"rows","data":"#));
        let back: PartialResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
