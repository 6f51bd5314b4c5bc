//! # Query Handlers
//!
//! Public `/select/logsql/*` endpoints and the node-internal partial query
//! endpoint. Query args are accepted from the query string and, for POST,
//! from a form body.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, Query as QueryArgs, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use super::plan::{self, PartialResult, RemoteQuery};
use super::run_query;
use crate::error::QueryError;
use crate::logsql::time::unix_seconds;
use crate::logsql::{parse_duration, parse_time, FacetsPipe, Pipe, Query, QueryRow};
use crate::metrics;
use crate::server::AppState;

type Pairs = Vec<(String, String)>;

/// Query args from the URL and the form body.
struct Params(Pairs);

impl Params {
    fn new(method: &Method, query: Pairs, form: Option<Form<Pairs>>) -> Self {
        let mut pairs = query;
        // A GET form is the query string again.
        if *method != Method::GET {
            if let Some(Form(body)) = form {
                pairs.extend(body);
            }
        }
        Self(pairs)
    }

    /// First non-empty value of `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    fn time(&self, key: &str, now: i64) -> Result<Option<i64>, QueryError> {
        self.get(key)
            .map(|s| parse_time(s, now).ok_or_else(|| QueryError::BadParam(format!("cannot parse {}={:?}", key, s))))
            .transpose()
    }

    fn u64(&self, key: &str) -> Result<Option<u64>, QueryError> {
        self.get(key)
            .map(|s| {
                s.parse()
                    .map_err(|_| QueryError::BadParam(format!("cannot parse {}={:?}: want a non-negative integer", key, s)))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
    }

    fn timeout(&self, default: Duration) -> Result<Duration, QueryError> {
        match self.get("timeout") {
            None => Ok(default),
            Some(s) => parse_duration(s)
                .filter(|d| *d > 0)
                .map(|d| Duration::from_nanos(d as u64))
                .ok_or_else(|| QueryError::BadParam(format!("cannot parse timeout={:?}", s))),
        }
    }

    /// `query` plus `extra_filters`, limited to `[start, end]`.
    fn query(&self, now: i64) -> Result<Query, QueryError> {
        let text = self
            .get("query")
            .ok_or_else(|| QueryError::BadParam("missing `query` arg".into()))?;
        let mut query = Query::parse(text, now)?;
        for extra in self.all("extra_filters") {
            let q = Query::parse(extra, now)?;
            if !q.pipes.is_empty() {
                return Err(QueryError::BadParam(format!("extra_filters={:?} must not contain pipes", extra)));
            }
            query.add_filter(q.filter);
        }
        let start = self.time("start", now)?;
        let end = self.time("end", now)?;
        query.add_time_range(start.unwrap_or(i64::MIN), end.unwrap_or(i64::MAX));
        Ok(query)
    }
}

/// Runs `f`, counting the request and its failure.
async fn counted<T>(f: impl Future<Output = Result<T, QueryError>>) -> Result<T, QueryError> {
    metrics::SELECT_REQUESTS.fetch_add(1, Ordering::Relaxed);
    let res = f.await;
    if res.is_err() {
        metrics::SELECT_ERRORS.fetch_add(1, Ordering::Relaxed);
    }
    res
}

// =============================================================================
// /select/logsql/query
// =============================================================================

pub async fn query(
    State(state): State<Arc<AppState>>,
    method: Method,
    QueryArgs(args): QueryArgs<Pairs>,
    form: Option<Form<Pairs>>,
) -> Result<Response, QueryError> {
    counted(serve_query(state, Params::new(&method, args, form))).await
}

async fn serve_query(state: Arc<AppState>, params: Params) -> Result<Response, QueryError> {
    let now = lh_core::now_nanos();
    let mut query = params.query(now)?;
    if let Some(limit) = params.u64("limit")? {
        query.pipes.push(Pipe::Limit { limit });
    }
    let rows = run_query(&state.topology, query, params.timeout(state.config.default_timeout)?).await?;

    let mut body = String::with_capacity(rows.len() * 128);
    for row in &rows {
        body.push_str(&row.to_json_line());
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "application/stream+json")], body).into_response())
}

// =============================================================================
// /select/logsql/facets
// =============================================================================

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FacetsResponse {
    pub facets: Vec<FieldFacets>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FieldFacets {
    pub field_name: String,
    pub values: Vec<FacetValue>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FacetValue {
    pub field_value: String,
    pub hits: u64,
}

pub async fn facets(
    State(state): State<Arc<AppState>>,
    method: Method,
    QueryArgs(args): QueryArgs<Pairs>,
    form: Option<Form<Pairs>>,
) -> Result<Json<FacetsResponse>, QueryError> {
    counted(serve_facets(state, Params::new(&method, args, form))).await
}

async fn serve_facets(state: Arc<AppState>, params: Params) -> Result<Json<FacetsResponse>, QueryError> {
    let mut query = params.query(lh_core::now_nanos())?;
    let defaults = FacetsPipe::default();
    query.pipes.push(Pipe::Facets(FacetsPipe {
        limit: params.u64("limit")?.unwrap_or(defaults.limit),
        max_values_per_field: params.u64("max_values_per_field")?.unwrap_or(defaults.max_values_per_field),
        max_value_len: params.u64("max_value_len")?.unwrap_or(defaults.max_value_len),
        keep_const_fields: params.flag("keep_const_fields"),
    }));
    let rows = run_query(&state.topology, query, params.timeout(state.config.default_timeout)?).await?;
    Ok(Json(group_facets(&rows)))
}

/// Folds `field_name, field_value, hits` rows into per-field lists, keeping
/// row order.
pub fn group_facets(rows: &[QueryRow]) -> FacetsResponse {
    let mut facets: Vec<FieldFacets> = Vec::new();
    for row in rows {
        let name = row.value("field_name");
        let value = FacetValue {
            field_value: row.value("field_value").to_string(),
            hits: row.value("hits").parse().unwrap_or(0),
        };
        match facets.last_mut() {
            Some(last) if last.field_name == name => last.values.push(value),
            _ => facets.push(FieldFacets {
                field_name: name.to_string(),
                values: vec![value],
            }),
        }
    }
    FacetsResponse { facets }
}

// =============================================================================
// /select/logsql/stats_query and stats_query_range
// =============================================================================

pub async fn stats_query(
    State(state): State<Arc<AppState>>,
    method: Method,
    QueryArgs(args): QueryArgs<Pairs>,
    form: Option<Form<Pairs>>,
) -> Result<Json<serde_json::Value>, QueryError> {
    counted(serve_stats_query(state, Params::new(&method, args, form))).await
}

async fn serve_stats_query(state: Arc<AppState>, params: Params) -> Result<Json<serde_json::Value>, QueryError> {
    let now = lh_core::now_nanos();
    let time = params.time("time", now)?.unwrap_or(now);
    let mut query = params.query(now)?;
    query.add_time_range(i64::MIN, time);
    let labels = stats_layout(&query)?;

    let rows = run_query(&state.topology, query, params.timeout(state.config.default_timeout)?).await?;
    let result: Vec<serde_json::Value> = rows
        .iter()
        .flat_map(|row| labels.series(row))
        .map(|(metric, value)| json!({ "metric": metric, "value": [unix_seconds(time), value] }))
        .collect();
    Ok(Json(json!({
        "status": "success",
        "data": { "resultType": "vector", "result": result },
    })))
}

pub async fn stats_query_range(
    State(state): State<Arc<AppState>>,
    method: Method,
    QueryArgs(args): QueryArgs<Pairs>,
    form: Option<Form<Pairs>>,
) -> Result<Json<serde_json::Value>, QueryError> {
    counted(serve_stats_query_range(state, Params::new(&method, args, form))).await
}

async fn serve_stats_query_range(state: Arc<AppState>, params: Params) -> Result<Json<serde_json::Value>, QueryError> {
    let now = lh_core::now_nanos();
    let step = match params.get("step") {
        None => 60_000_000_000,
        Some(s) => parse_duration(s)
            .filter(|d| *d > 0)
            .ok_or_else(|| QueryError::BadParam(format!("cannot parse step={:?}", s)))?,
    };
    let mut query = params.query(now)?;
    if params.get("end").is_none() {
        query.add_time_range(i64::MIN, now);
    }
    query
        .stats_pipe_mut()
        .ok_or_else(|| QueryError::BadParam("the query must contain a stats pipe".into()))?
        .set_time_step(step);
    let labels = stats_layout(&query)?;

    let rows = run_query(&state.topology, query, params.timeout(state.config.default_timeout)?).await?;
    let mut series: BTreeMap<String, (serde_json::Value, Vec<(i64, String)>)> = BTreeMap::new();
    for row in &rows {
        let Some(ts) = row.timestamp else { continue };
        for (metric, value) in labels.series(row) {
            let key = metric.to_string();
            series.entry(key).or_insert_with(|| (metric, Vec::new())).1.push((ts, value));
        }
    }
    let result: Vec<serde_json::Value> = series
        .into_values()
        .map(|(metric, mut points)| {
            points.sort_by_key(|(ts, _)| *ts);
            let values: Vec<serde_json::Value> =
                points.into_iter().map(|(ts, v)| json!([unix_seconds(ts), v])).collect();
            json!({ "metric": metric, "values": values })
        })
        .collect();
    Ok(Json(json!({
        "status": "success",
        "data": { "resultType": "matrix", "result": result },
    })))
}

/// Which output fields are labels and which are values.
struct StatsLayout {
    labels: Vec<String>,
    values: Vec<String>,
}

fn stats_layout(query: &Query) -> Result<StatsLayout, QueryError> {
    let Some(Pipe::Stats(stats)) = query.pipes.iter().rev().find(|p| matches!(p, Pipe::Stats(_))) else {
        return Err(QueryError::BadParam("the query must contain a stats pipe".into()));
    };
    Ok(StatsLayout {
        labels: stats
            .by
            .iter()
            .filter(|b| b.name != lh_core::TIME_FIELD)
            .map(|b| b.name.clone())
            .collect(),
        values: stats.funcs.iter().map(|f| f.result.clone()).collect(),
    })
}

impl StatsLayout {
    /// One `(metric, value)` per stats function present in `row`.
    fn series<'a>(&'a self, row: &'a QueryRow) -> impl Iterator<Item = (serde_json::Value, String)> + 'a {
        self.values.iter().filter_map(move |name| {
            let value = row.get(name)?;
            let mut metric = serde_json::Map::new();
            metric.insert("__name__".into(), name.clone().into());
            for label in &self.labels {
                metric.insert(label.clone(), row.value(label).into());
            }
            Some((serde_json::Value::Object(metric), value.to_string()))
        })
    }
}

// =============================================================================
// /internal/select/query
// =============================================================================

pub async fn internal_query(
    State(state): State<Arc<AppState>>,
    Json(q): Json<RemoteQuery>,
) -> Result<Json<PartialResult>, (StatusCode, String)> {
    let Some(storage) = state.storage.clone() else {
        return Err((StatusCode::NOT_FOUND, "this node has no local storage".into()));
    };
    tokio::task::spawn_blocking(move || plan::execute(&storage, &q))
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("partial query failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_core::Field;

    fn facet_row(name: &str, value: &str, hits: u64) -> QueryRow {
        QueryRow::new(
            None,
            vec![
                Field::new("field_name", name),
                Field::new("field_value", value),
                Field::new("hits", hits.to_string()),
            ],
        )
    }

    #[test]
    fn test_group_facets_json() {
        let rows = vec![facet_row("x", "y", 4), facet_row("x", "z", 1), facet_row("y", "a", 2)];
        let json = serde_json::to_string(&group_facets(&rows)).unwrap();
        assert_eq!(
            json,
            r#"{"facets":[{"field_name":"x","values":[{"field_value":"y","hits":4},{"field_value":"z","hits":1}]},{"field_name":"y","values":[{"field_value":"a","hits":2}]}]}"#
        );
    }

    #[test]
    fn test_params_merge_and_extra_filters() {
        let params = Params::new(
            &Method::POST,
            vec![("query".into(), "error".into()), ("extra_filters".into(), "host:=a".into())],
            Some(Form(vec![("extra_filters".into(), "app:=b".into()), ("limit".into(), "5".into())])),
        );
        let q = params.query(0).unwrap();
        match &q.filter {
            crate::logsql::Filter::And { filters } => assert_eq!(filters.len(), 3),
            other => panic!("unexpected filter {:?}", other),
        }
        assert_eq!(params.u64("limit").unwrap(), Some(5));

        let bad = Params(vec![("query".into(), "*".into()), ("extra_filters".into(), "a | limit 1".into())]);
        assert!(matches!(bad.query(0), Err(QueryError::BadParam(_))));
    }

    #[test]
    fn test_stats_layout_series() {
        let q = Query::parse("* | stats by (host) count() as n, sum(x)", 0).unwrap();
        let layout = stats_layout(&q).unwrap();
        let row = QueryRow::new(None, vec![Field::new("host", "h1"), Field::new("n", "3"), Field::new("sum(x)", "7")]);
        let series: Vec<_> = layout.series(&row).collect();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].0, json!({"__name__": "n", "host": "h1"}));
        assert_eq!(series[0].1, "3");
        assert_eq!(series[1].0["__name__"], "sum(x)");

        assert!(stats_layout(&Query::parse("*", 0).unwrap()).is_err());
    }
}
