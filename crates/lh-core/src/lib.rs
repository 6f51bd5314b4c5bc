//! # lh-core: the row model of Loggerhead
//!
//! Every ingestion format converges on the types defined here:
//!
//! - [`Field`]: a `(name, value)` pair of strings.
//! - [`LogRow`]: the canonical row: a nanosecond timestamp plus fields.
//! - [`DecodedRow`]: decoder output, with stream fields kept in their own
//!   group instead of a positional prefix.
//! - [`StoredRow`]: a classified row, carrying its immutable [`StreamTags`]
//!   and [`StreamId`].
//!
//! The [`native`] module holds the versioned binary encoding used for bulk
//! ingestion and for node-to-node transfer.

pub mod error;
pub mod native;
pub mod row;
pub mod stream;

pub use error::DecodeError;
pub use row::{dedup_fields, DecodedRow, Field, LogRow, StoredRow};
pub use stream::{StreamId, StreamTags};

/// Reserved name of the message field.
pub const MSG_FIELD: &str = "_msg";

/// Reserved name of the timestamp field as seen by queries.
pub const TIME_FIELD: &str = "_time";

/// Reserved name of the rendered stream tags as seen by queries.
pub const STREAM_FIELD: &str = "_stream";

/// Reserved name of the hex stream identifier as seen by queries.
pub const STREAM_ID_FIELD: &str = "_stream_id";

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Returns `true` for names that are computed by the engine and can never be
/// supplied by a client.
pub fn is_reserved_field(name: &str) -> bool {
    name == TIME_FIELD || name == STREAM_FIELD || name == STREAM_ID_FIELD
}
