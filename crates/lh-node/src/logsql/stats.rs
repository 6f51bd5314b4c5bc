//! # `stats` pipe
//!
//! Each function keeps a mergeable state per group. Storage nodes return
//! [`PartialStats`]; the select side merges them and renders final rows.
//! Every merge is associative and commutative, so shard order never changes
//! the result.

use std::collections::{BTreeMap, BTreeSet};

use lh_core::{Field, TIME_FIELD};
use serde::{Deserialize, Serialize};

use super::row::QueryRow;
use super::time::{format_time, parse_time};
use crate::error::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    Count,
    CountUniq,
    Sum,
    Min,
    Max,
    Avg,
}

impl StatsKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "count_uniq" => Self::CountUniq,
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "avg" => Self::Avg,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::CountUniq => "count_uniq",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsFunc {
    pub kind: StatsKind,
    /// Empty means every row (`count()`).
    pub fields: Vec<String>,
    pub result: String,
}

impl StatsFunc {
    pub fn new(kind: StatsKind, fields: Vec<String>) -> Self {
        let fields: Vec<String> = fields.into_iter().filter(|f| f != "*").collect();
        let args = if fields.is_empty() {
            "*".to_string()
        } else {
            fields.join(", ")
        };
        let result = format!("{}({})", kind.name(), args);
        Self { kind, fields, result }
    }

    fn numbers<'r>(&'r self, row: &'r QueryRow) -> impl Iterator<Item = f64> + 'r {
        self.fields
            .iter()
            .filter_map(move |f| row.get(f))
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// A `by` entry. `step` buckets `_time` into fixed windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPipe {
    pub by: Vec<ByField>,
    pub funcs: Vec<StatsFunc>,
}

impl StatsPipe {
    fn group_key(&self, row: &QueryRow) -> Vec<String> {
        self.by
            .iter()
            .map(|b| match b.step {
                Some(step) if b.name == TIME_FIELD && step > 0 => row
                    .timestamp
                    .map(|ts| format_time(ts.div_euclid(step) * step))
                    .unwrap_or_default(),
                _ => row.value(&b.name).to_string(),
            })
            .collect()
    }

    /// Buckets `_time` by `step`, replacing an existing `_time` entry.
    pub fn set_time_step(&mut self, step: i64) {
        self.by.retain(|b| b.name != TIME_FIELD);
        self.by.insert(
            0,
            ByField {
                name: TIME_FIELD.into(),
                step: Some(step),
            },
        );
    }
}

/// Mergeable per-function state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsState {
    Count(u64),
    /// Exact distinct value tuples.
    CountUniq(BTreeSet<Vec<String>>),
    Sum(Option<f64>),
    Min(Option<f64>),
    Max(Option<f64>),
    Avg { sum: f64, count: u64 },
}

impl StatsState {
    pub fn new(kind: StatsKind) -> Self {
        match kind {
            StatsKind::Count => Self::Count(0),
            StatsKind::CountUniq => Self::CountUniq(BTreeSet::new()),
            StatsKind::Sum => Self::Sum(None),
            StatsKind::Min => Self::Min(None),
            StatsKind::Max => Self::Max(None),
            StatsKind::Avg => Self::Avg { sum: 0.0, count: 0 },
        }
    }

    pub fn add(&mut self, func: &StatsFunc, row: &QueryRow) {
        match self {
            Self::Count(n) => {
                if func.fields.is_empty() || func.fields.iter().any(|f| !row.value(f).is_empty()) {
                    *n += 1;
                }
            }
            Self::CountUniq(set) => {
                let key: Vec<String> = if func.fields.is_empty() {
                    row.fields.iter().map(|f| format!("{}={}", f.name, f.value)).collect()
                } else {
                    func.fields.iter().map(|f| row.value(f).to_string()).collect()
                };
                if key.iter().any(|v| !v.is_empty()) {
                    set.insert(key);
                }
            }
            Self::Sum(sum) => {
                for v in func.numbers(row) {
                    *sum = Some(sum.unwrap_or(0.0) + v);
                }
            }
            Self::Min(min) => {
                for v in func.numbers(row) {
                    *min = Some(min.map_or(v, |m| m.min(v)));
                }
            }
            Self::Max(max) => {
                for v in func.numbers(row) {
                    *max = Some(max.map_or(v, |m| m.max(v)));
                }
            }
            Self::Avg { sum, count } => {
                for v in func.numbers(row) {
                    *sum += v;
                    *count += 1;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::CountUniq(_) => "count_uniq",
            Self::Sum(_) => "sum",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::Avg { .. } => "avg",
        }
    }

    pub fn merge(&mut self, other: StatsState) -> Result<(), MergeError> {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => *a += b,
            (Self::CountUniq(a), Self::CountUniq(b)) => a.extend(b),
            (Self::Sum(a), Self::Sum(b)) => *a = merge_opt(*a, b, |x, y| x + y),
            (Self::Min(a), Self::Min(b)) => *a = merge_opt(*a, b, f64::min),
            (Self::Max(a), Self::Max(b)) => *a = merge_opt(*a, b, f64::max),
            (Self::Avg { sum, count }, Self::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (a, b) => {
                return Err(MergeError::State {
                    want: a.name(),
                    got: b.name(),
                })
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> String {
        match self {
            Self::Count(n) => n.to_string(),
            Self::CountUniq(set) => set.len().to_string(),
            Self::Sum(v) | Self::Min(v) | Self::Max(v) => v.map(format_number).unwrap_or_else(|| "NaN".into()),
            Self::Avg { sum, count } => {
                if *count == 0 {
                    "NaN".into()
                } else {
                    format_number(sum / *count as f64)
                }
            }
        }
    }
}

fn merge_opt(a: Option<f64>, b: Option<f64>, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Whole numbers print without a fractional part.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Per-group states for one `stats` pipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StatsGroup>", into = "Vec<StatsGroup>")]
pub struct PartialStats {
    groups: BTreeMap<Vec<String>, Vec<StatsState>>,
}

/// Wire form of one group; JSON objects cannot key on arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsGroup {
    keys: Vec<String>,
    states: Vec<StatsState>,
}

impl From<PartialStats> for Vec<StatsGroup> {
    fn from(p: PartialStats) -> Self {
        p.groups
            .into_iter()
            .map(|(keys, states)| StatsGroup { keys, states })
            .collect()
    }
}

impl TryFrom<Vec<StatsGroup>> for PartialStats {
    type Error = MergeError;

    fn try_from(groups: Vec<StatsGroup>) -> Result<Self, MergeError> {
        let mut out = PartialStats::default();
        for g in groups {
            out.merge_group(g.keys, g.states)?;
        }
        Ok(out)
    }
}

impl PartialStats {
    pub fn add_row(&mut self, pipe: &StatsPipe, row: &QueryRow) {
        let key = pipe.group_key(row);
        let states = self
            .groups
            .entry(key)
            .or_insert_with(|| pipe.funcs.iter().map(|f| StatsState::new(f.kind)).collect());
        for (state, func) in states.iter_mut().zip(&pipe.funcs) {
            state.add(func, row);
        }
    }

    /// Fails without a usable result when `other` was computed for a
    /// different pipe.
    pub fn merge(&mut self, other: PartialStats) -> Result<(), MergeError> {
        for (keys, states) in other.groups {
            self.merge_group(keys, states)?;
        }
        Ok(())
    }

    fn merge_group(&mut self, keys: Vec<String>, states: Vec<StatsState>) -> Result<(), MergeError> {
        match self.groups.get_mut(&keys) {
            Some(existing) => {
                if existing.len() != states.len() {
                    return Err(MergeError::Arity {
                        want: existing.len(),
                        got: states.len(),
                    });
                }
                for (a, b) in existing.iter_mut().zip(states) {
                    a.merge(b)?;
                }
            }
            None => {
                self.groups.insert(keys, states);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// One row per group: the `by` fields then one field per function.
    /// Without `by`, an empty input still yields one row of initial values.
    pub fn finalize(&self, pipe: &StatsPipe) -> Vec<QueryRow> {
        let render = |keys: &[String], states: &[StatsState]| {
            let mut fields = Vec::with_capacity(keys.len() + states.len());
            let mut timestamp = None;
            for (b, key) in pipe.by.iter().zip(keys) {
                if b.name == TIME_FIELD {
                    timestamp = parse_time(key, 0);
                }
                fields.push(Field::new(b.name.clone(), key.clone()));
            }
            for (func, state) in pipe.funcs.iter().zip(states) {
                fields.push(Field::new(func.result.clone(), state.finalize()));
            }
            QueryRow::new(timestamp, fields)
        };

        if self.groups.is_empty() && pipe.by.is_empty() {
            let states: Vec<StatsState> = pipe.funcs.iter().map(|f| StatsState::new(f.kind)).collect();
            return vec![render(&[], &states)];
        }
        self.groups
            .iter()
            .map(|(keys, states)| render(keys, states))
            .collect()
    }
}
