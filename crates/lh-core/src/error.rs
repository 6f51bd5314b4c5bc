use thiserror::Error;

/// Failure to decode a native row payload.
///
/// Offsets are byte positions into the request body, rows are counted from 0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {offset} while reading {what} of row #{row}")]
    Truncated {
        offset: usize,
        row: usize,
        what: &'static str,
    },

    #[error("malformed varint at offset {offset} in row #{row}")]
    Varint { offset: usize, row: usize },

    #[error("{what} at offset {offset} in row #{row} is not valid UTF-8")]
    InvalidUtf8 {
        offset: usize,
        row: usize,
        what: &'static str,
    },

    #[error("row #{row} declares {stream_fields} stream fields but carries only {fields} fields")]
    StreamFieldsOverflow {
        row: usize,
        stream_fields: u64,
        fields: u64,
    },

    #[error("unsupported native format version {0:?}; supported versions: v1")]
    UnsupportedVersion(String),
}
