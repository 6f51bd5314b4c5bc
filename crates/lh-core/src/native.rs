//! # Native Row Encoding
//!
//! Compact binary form of decoded rows, used by `/insert/native` and by
//! insert nodes forwarding classified rows to storage nodes. A payload is a
//! plain concatenation of rows; there is no outer header; the format
//! version travels out of band (`?version=v1`) so that a mismatched writer
//! is rejected instead of misparsed.
//!
//! # Row Layout (v1)
//!
//! | Part                 | Encoding                                  |
//! |----------------------|-------------------------------------------|
//! | `stream_fields_len`  | unsigned LEB128 varint                    |
//! | `field_count`        | unsigned LEB128 varint                    |
//! | fields × count       | varint len + name bytes, varint len + value bytes |
//! | `timestamp`          | 8 bytes, big-endian `i64` nanoseconds     |
//!
//! The leading `stream_fields_len` fields are the stream fields. A
//! timestamp of `0` means "not set".

use crate::error::DecodeError;
use crate::row::{DecodedRow, Field, LogRow, StoredRow};

/// The only version this build reads and writes.
pub const NATIVE_VERSION: &str = "v1";

/// Rejects every version other than [`NATIVE_VERSION`].
pub fn check_version(version: &str) -> Result<(), DecodeError> {
    if version == NATIVE_VERSION {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedVersion(version.to_string()))
    }
}

/// Appends an unsigned LEB128 varint.
pub fn put_varint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Appends one row in the v1 layout.
pub fn marshal_row(dst: &mut Vec<u8>, timestamp: Option<i64>, stream_fields: &[Field], other_fields: &[Field]) {
    put_varint(dst, stream_fields.len() as u64);
    put_varint(dst, (stream_fields.len() + other_fields.len()) as u64);
    for field in stream_fields.iter().chain(other_fields) {
        put_varint(dst, field.name.len() as u64);
        dst.extend_from_slice(field.name.as_bytes());
        put_varint(dst, field.value.len() as u64);
        dst.extend_from_slice(field.value.as_bytes());
    }
    dst.extend_from_slice(&timestamp.unwrap_or(0).to_be_bytes());
}

impl DecodedRow {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_row(dst, self.timestamp, &self.stream_fields, &self.other_fields);
    }
}

impl LogRow {
    /// Encodes the row with no stream fields.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_row(dst, Some(self.timestamp), &[], &self.fields);
    }
}

impl StoredRow {
    /// Encodes the row with its stream tags as the stream group.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        self.to_decoded().marshal(dst);
    }
}

/// Decodes a whole payload. Any malformed row fails the entire payload.
pub fn unmarshal_rows(data: &[u8]) -> Result<Vec<DecodedRow>, DecodeError> {
    let mut reader = Reader { data, pos: 0, row: 0 };
    let mut rows = Vec::new();
    while reader.pos < data.len() {
        rows.push(reader.read_row()?);
        reader.row += 1;
    }
    Ok(rows)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    row: usize,
}

impl Reader<'_> {
    fn read_row(&mut self) -> Result<DecodedRow, DecodeError> {
        let stream_fields_len = self.read_varint()?;
        let field_count = self.read_varint()?;
        if stream_fields_len > field_count {
            return Err(DecodeError::StreamFieldsOverflow {
                row: self.row,
                stream_fields: stream_fields_len,
                fields: field_count,
            });
        }

        // Every field needs at least two length bytes; cap the allocation
        // by what the remaining input could possibly hold.
        let remaining = (self.data.len() - self.pos) / 2;
        let mut fields = Vec::with_capacity((field_count as usize).min(remaining));
        for _ in 0..field_count {
            let name = self.read_str("field name")?;
            let value = self.read_str("field value")?;
            fields.push(Field { name, value });
        }

        let ts_bytes = self.take(8, "timestamp")?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(ts_bytes);
        let timestamp = match i64::from_be_bytes(buf) {
            0 => None,
            ts => Some(ts),
        };

        Ok(DecodedRow::from_positional(timestamp, fields, stream_fields_len as usize))
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let Some(&b) = self.data.get(self.pos) else {
                return Err(DecodeError::Truncated {
                    offset: self.pos,
                    row: self.row,
                    what: "varint",
                });
            };
            self.pos += 1;
            if shift >= 64 {
                return Err(DecodeError::Varint {
                    offset: start,
                    row: self.row,
                });
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(DecodeError::Truncated {
                offset: self.pos,
                row: self.row,
                what,
            }),
        }
    }

    fn read_str(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let len = self.read_varint()?;
        let offset = self.pos;
        let len = usize::try_from(len).map_err(|_| DecodeError::Truncated {
            offset,
            row: self.row,
            what,
        })?;
        let row = self.row;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { offset, row, what })
    }
}
