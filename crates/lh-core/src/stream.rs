//! # Streams
//!
//! A stream is the set of `(name, value)` pairs taken from a row's stream
//! fields. Two rows belong to the same stream iff those sets are equal, so
//! the tags are kept sorted and deduplicated and the id is a hash over that
//! canonical form.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::native::put_varint;
use crate::row::{dedup_fields, Field};

/// Sorted, deduplicated stream tags. Tags with empty values are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StreamTags {
    tags: Vec<Field>,
}

impl StreamTags {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Self {
        let fields: Vec<Field> = fields.into_iter().filter(|f| !f.value.is_empty()).collect();
        let mut tags = dedup_fields(fields);
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Self { tags }
    }

    pub fn tags(&self) -> &[Field] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| self.tags[i].value.as_str())
    }

    /// Renders the tags as `{a="b",c="d"}`.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(2 + self.tags.len() * 16);
        out.push('{');
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&tag.name);
            out.push_str("=\"");
            for c in tag.value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        out.push('}');
        out
    }

    /// 128-bit identity of the stream.
    pub fn id(&self) -> StreamId {
        let mut buf = Vec::with_capacity(self.tags.len() * 32);
        for tag in &self.tags {
            put_varint(&mut buf, tag.name.len() as u64);
            buf.extend_from_slice(tag.name.as_bytes());
            put_varint(&mut buf, tag.value.len() as u64);
            buf.extend_from_slice(tag.value.as_bytes());
        }
        let digest = Sha256::digest(&buf);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        StreamId(id)
    }
}

impl fmt::Display for StreamTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Truncated SHA-256 of the canonical stream tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub [u8; 16]);

impl StreamId {
    /// Shard index for `shards` shards. `shards` must be non-zero.
    pub fn shard(&self, shards: usize) -> usize {
        let mut lo = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        (u64::from_be_bytes(lo) % shards as u64) as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
