//! # LogsQL subset
//!
//! A filter expression followed by `|`-separated pipes:
//!
//! ```text
//! _time:5m error host:=db-1 | stats by (host) count() as errors | sort by (errors desc) | limit 5
//! ```
//!
//! Filters: `*`, words, `"phrases"`, `prefix*`, `field:=exact`,
//! `field:in(a, b)`, `field:~"regex"`, `field:>N` (and `>=`, `<`, `<=`),
//! `_time:5m`, `_time:>=2024-01-01T00:00:00Z`, `_stream:{a="b"}`, combined
//! with `and` (or juxtaposition), `or`, `not`/`!` and parentheses.
//!
//! Pipes: `filter`/`where`, `fields`, `limit`/`head`, `sort`, `stats` (the
//! keyword is optional) and `facets`.

pub mod facets;
pub mod filter;
mod lexer;
pub mod parser;
pub mod pipes;
pub mod row;
pub mod stats;
pub mod time;

use serde::{Deserialize, Serialize};

pub use facets::{FacetsPipe, PartialFacets};
pub use filter::{CompareOp, Filter};
pub use pipes::{apply_pipes, Pipe, SortKey, SortPipe};
pub use row::QueryRow;
pub use stats::{ByField, PartialStats, StatsFunc, StatsKind, StatsPipe};
pub use time::{format_time, parse_duration, parse_time};

/// A query that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse query at position {pos}: {message}")]
pub struct ParseError {
    pub pos: usize,
    pub message: String,
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Filter,
    pub pipes: Vec<Pipe>,
}

impl Query {
    /// Parses `text`. Relative time filters such as `_time:5m` resolve
    /// against `now` (nanoseconds).
    pub fn parse(text: &str, now: i64) -> Result<Self, ParseError> {
        parser::parse(text, now)
    }

    /// ANDs `filter` into the top-level filter.
    pub fn add_filter(&mut self, filter: Filter) {
        let current = std::mem::replace(&mut self.filter, Filter::All);
        self.filter = match current {
            Filter::All => filter,
            Filter::And { mut filters } => {
                filters.push(filter);
                Filter::And { filters }
            }
            other => Filter::And {
                filters: vec![other, filter],
            },
        };
    }

    /// Restricts the query to `[min, max]` nanoseconds.
    pub fn add_time_range(&mut self, min: i64, max: i64) {
        if min != i64::MIN || max != i64::MAX {
            self.add_filter(Filter::Time { min, max });
        }
    }

    /// The time range implied by top-level time filters, for pruning the
    /// scan. Rows are still matched against the full filter.
    pub fn time_range(&self) -> (i64, i64) {
        self.filter.time_range()
    }

    /// The last `stats` pipe, if any.
    pub fn stats_pipe_mut(&mut self) -> Option<&mut StatsPipe> {
        self.pipes.iter_mut().rev().find_map(|p| match p {
            Pipe::Stats(s) => Some(s),
            _ => None,
        })
    }
}
