//! # Ingestion
//!
//! Decoders for every supported wire format, the field classifier, and the
//! request flow shared by all ingestion endpoints:
//!
//! 1. admission check against the storage backends,
//! 2. bounded body read and inflation,
//! 3. decode,
//! 4. classify,
//! 5. write to the owning shards; nothing is acknowledged before that.

pub mod compress;
pub mod handlers;
pub mod jsonline;
pub mod opentelemetry;
pub mod processor;

use std::time::Instant;

use axum::body::Body;
use axum::http::HeaderMap;
use lh_core::native::unmarshal_rows;
use lh_core::{DecodedRow, Field, TIME_FIELD};

use crate::error::InsertError;
use crate::metrics::PathMetrics;
use crate::topology::Topology;
pub use jsonline::JsonLineParams;
pub use processor::{process, ClassifyParams};

/// A line rejected by a line-oriented decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    /// 1-based.
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct DecodeOutcome {
    pub rows: Vec<DecodedRow>,
    pub skipped: Vec<LineError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    OpenTelemetry,
    JsonLine(JsonLineParams),
    Native,
}

impl Format {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenTelemetry => "opentelemetry",
            Self::JsonLine(_) => "jsonline",
            Self::Native => "native",
        }
    }
}

/// Decodes a whole request body. OpenTelemetry and native payloads are
/// all-or-nothing; JSON lines fail line by line.
pub fn decode(format: &Format, data: &[u8]) -> Result<DecodeOutcome, InsertError> {
    match format {
        Format::OpenTelemetry => opentelemetry::decode(data)
            .map(|rows| DecodeOutcome { rows, skipped: Vec::new() })
            .map_err(|source| InsertError::OpenTelemetry {
                bytes: data.len(),
                source,
            }),
        Format::JsonLine(params) => Ok(jsonline::decode(data, params)),
        Format::Native => unmarshal_rows(data)
            .map(|rows| DecodeOutcome { rows, skipped: Vec::new() })
            .map_err(|source| InsertError::Native {
                bytes: data.len(),
                source,
            }),
    }
}

// =============================================================================
// Common Params
// =============================================================================

/// Ingestion settings shared by every format, taken from the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonParams {
    pub classify: ClassifyParams,
    pub time_fields: Vec<String>,
}

impl Default for CommonParams {
    fn default() -> Self {
        Self {
            classify: ClassifyParams::default(),
            time_fields: vec![TIME_FIELD.to_string()],
        }
    }
}

impl CommonParams {
    /// Reads `_msg_field`, `_stream_fields`, `_time_field`, `ignore_fields`
    /// and `extra_fields`. List values are comma separated and the args may
    /// repeat.
    pub fn from_query(pairs: &[(String, String)]) -> Result<Self, InsertError> {
        let list = |key: &str| -> Vec<String> {
            pairs
                .iter()
                .filter(|(k, _)| k == key)
                .flat_map(|(_, v)| v.split(','))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };

        let mut params = Self::default();
        let msg_fields = list("_msg_field");
        if !msg_fields.is_empty() {
            params.classify.msg_fields = msg_fields;
        }
        let stream_fields = list("_stream_fields");
        if !stream_fields.is_empty() {
            params.classify.stream_fields = Some(stream_fields);
        }
        let time_fields = list("_time_field");
        if !time_fields.is_empty() {
            params.time_fields = time_fields;
        }
        params.classify.ignore_fields = list("ignore_fields");
        params.classify.extra_fields = list("extra_fields")
            .into_iter()
            .map(|kv| match kv.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => Ok(Field::new(name.trim(), value.trim())),
                _ => Err(InsertError::BadParam {
                    param: "extra_fields",
                    message: format!("missing '=' in {:?}; want name=value", kv),
                }),
            })
            .collect::<Result<_, _>>()?;
        Ok(params)
    }
}

// =============================================================================
// Request Flow
// =============================================================================

/// One ingestion request, ready to run.
pub struct Ingest<'a> {
    pub topology: &'a Topology,
    pub metrics: &'static PathMetrics,
    pub format: Format,
    pub params: ClassifyParams,
    pub max_request_size: usize,
}

impl Ingest<'_> {
    /// Runs the request and returns the number of rows stored.
    pub async fn run(self, headers: &HeaderMap, body: Body) -> Result<usize, InsertError> {
        let start = Instant::now();
        self.metrics.request();
        match self.run_inner(headers, body).await {
            Ok(rows) => {
                self.metrics.duration(start.elapsed());
                Ok(rows)
            }
            Err(e) => {
                self.metrics.error();
                Err(e)
            }
        }
    }

    async fn run_inner(&self, headers: &HeaderMap, body: Body) -> Result<usize, InsertError> {
        let name = self.format.name();
        self.topology.can_write().await?;

        let raw = compress::read_body(name, headers, body, self.max_request_size).await?;
        let data = compress::decompress(name, headers, raw, self.max_request_size)?;
        let outcome = decode(&self.format, &data)?;

        for skipped in &outcome.skipped {
            tracing::warn!(format = name, line = skipped.line, "skipping line: {}", skipped.message);
        }
        self.metrics.skipped(outcome.skipped.len());

        let now = lh_core::now_nanos();
        let rows: Vec<_> = outcome.rows.into_iter().map(|r| process(r, &self.params, now)).collect();
        let n = rows.len();
        self.topology.write(rows).await?;
        self.metrics.rows(n);
        tracing::debug!(format = name, rows = n, bytes = data.len(), "ingested");
        Ok(n)
    }
}
