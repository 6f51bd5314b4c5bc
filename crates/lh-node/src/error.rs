//! # Errors
//!
//! Every failure a request can hit, and the HTTP status it maps to.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lh_core::DecodeError;
use lh_store::StoreError;

use crate::logsql::ParseError;

/// Failure talking to a storage backend, local or remote.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("storage node {node} cannot accept writes: {message}")]
    CannotWrite { node: String, message: String },

    #[error("storage node {node} is unreachable: {source}")]
    Unreachable {
        node: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("storage node {node} responded with status {status}: {message}")]
    Status {
        node: String,
        status: u16,
        message: String,
    },

    #[error("cannot decode response from storage node {node}: {message}")]
    BadResponse { node: String, message: String },

    #[error("storage node {node} failed: {message}")]
    Internal { node: String, message: String },
}

impl BackendError {
    pub fn from_store(node: impl Into<String>, err: StoreError) -> Self {
        let node = node.into();
        match err {
            StoreError::CannotWrite(message) => Self::CannotWrite { node, message },
            other => Self::Internal {
                node,
                message: other.to_string(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::CannotWrite { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unreachable { .. } | Self::Status { .. } | Self::BadResponse { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Failure of an ingestion request. Nothing is acknowledged when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error("cannot parse {param} query arg: {message}")]
    BadParam { param: &'static str, message: String },

    #[error("json encoding isn't supported for opentelemetry format. Use protobuf encoding")]
    OpenTelemetryJson,

    #[error("cannot decode LogsData request from {bytes} bytes: {source}")]
    OpenTelemetry {
        bytes: usize,
        #[source]
        source: prost::DecodeError,
    },

    #[error("cannot decode native request from {bytes} bytes: {source}")]
    Native {
        bytes: usize,
        #[source]
        source: DecodeError,
    },

    #[error("cannot decode {format} request: unsupported Content-Encoding {encoding:?}")]
    UnsupportedEncoding { format: &'static str, encoding: String },

    #[error("cannot decompress {format} request with {encoding} from {bytes} bytes: {source}")]
    Decompress {
        format: &'static str,
        encoding: &'static str,
        bytes: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {format} request body: {message}")]
    Body { format: &'static str, message: String },

    #[error("{format} request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { format: &'static str, limit: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl InsertError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backend(e) => e.status(),
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for InsertError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(status = status.as_u16(), "insert failed: {}", self);
        (status, self.to_string()).into_response()
    }
}

/// Shard results that cannot be combined into one answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge a {got} partial result into a {want} result")]
    Kind { want: &'static str, got: &'static str },

    #[error("cannot merge a {got} stats state into a {want} stats state")]
    State { want: &'static str, got: &'static str },

    #[error("stats group has {got} states, expected {want}")]
    Arity { want: usize, got: usize },
}

/// Failure of a query request. A query never returns a partial merge.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0}")]
    BadParam(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::BadParam(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Backend(e) => e.status(),
            Self::Merge(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(status = status.as_u16(), "query failed: {}", self);
        (status, self.to_string()).into_response()
    }
}
