//! # Ingestion Handlers

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use lh_core::native::check_version;

use super::{ClassifyParams, CommonParams, Format, Ingest, JsonLineParams};
use crate::error::InsertError;
use crate::metrics::{self, PathMetrics};
use crate::server::AppState;

type Pairs = Vec<(String, String)>;

// =============================================================================
// Public
// =============================================================================

pub async fn opentelemetry(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Pairs>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InsertError> {
    if is_json(&headers) {
        metrics::OPENTELEMETRY.request();
        metrics::OPENTELEMETRY.error();
        return Err(InsertError::OpenTelemetryJson);
    }
    let params = common_params(&metrics::OPENTELEMETRY, &pairs)?;
    ingest(&state, &metrics::OPENTELEMETRY, Format::OpenTelemetry, params.classify, state.config.max_request_size)
        .run(&headers, body)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn jsonline(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Pairs>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InsertError> {
    let params = common_params(&metrics::JSONLINE, &pairs)?;
    let format = Format::JsonLine(JsonLineParams {
        time_fields: params.time_fields,
    });
    ingest(&state, &metrics::JSONLINE, format, params.classify, state.config.max_request_size)
        .run(&headers, body)
        .await?;
    Ok(StatusCode::OK)
}

pub async fn native(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Pairs>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InsertError> {
    native_version(&metrics::NATIVE, &pairs)?;
    let params = common_params(&metrics::NATIVE, &pairs)?;
    ingest(&state, &metrics::NATIVE, Format::Native, params.classify, state.config.max_request_size)
        .run(&headers, body)
        .await?;
    Ok(StatusCode::OK)
}

// =============================================================================
// Internal
// =============================================================================

/// Rows from an insert node, already classified. Re-running the classifier
/// with default params keeps them as they are.
pub async fn internal_insert(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Pairs>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, InsertError> {
    native_version(&metrics::INTERNAL_INSERT, &pairs)?;
    // Peers are trusted; the public limit was enforced where the request
    // entered the cluster.
    ingest(&state, &metrics::INTERNAL_INSERT, Format::Native, ClassifyParams::default(), usize::MAX)
        .run(&headers, body)
        .await?;
    Ok(StatusCode::OK)
}

/// Admission check for insert nodes, run before they decode a request.
pub async fn internal_can_write(State(state): State<Arc<AppState>>) -> Result<StatusCode, InsertError> {
    state.topology.can_write().await?;
    Ok(StatusCode::OK)
}

// =============================================================================
// Helpers
// =============================================================================

fn ingest<'a>(
    state: &'a AppState,
    metrics: &'static PathMetrics,
    format: Format,
    params: ClassifyParams,
    max_request_size: usize,
) -> Ingest<'a> {
    Ingest {
        topology: &state.topology,
        metrics,
        format,
        params,
        max_request_size,
    }
}

fn common_params(metrics: &PathMetrics, pairs: &[(String, String)]) -> Result<CommonParams, InsertError> {
    CommonParams::from_query(pairs).map_err(|e| {
        metrics.request();
        metrics.error();
        e
    })
}

fn native_version(metrics: &PathMetrics, pairs: &[(String, String)]) -> Result<(), InsertError> {
    let version = pairs
        .iter()
        .find(|(k, _)| k == "version")
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();
    check_version(version).map_err(|e| {
        metrics.request();
        metrics.error();
        InsertError::BadParam {
            param: "version",
            message: e.to_string(),
        }
    })
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("application/json"))
}
