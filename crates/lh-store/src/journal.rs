//! # Journal: Append-Only Row Log
//!
//! Every accepted batch of rows is appended to a single file before the
//! write is acknowledged. Records are framed and checksummed:
//!
//! | Offset | Size | Field                              |
//! |--------|------|------------------------------------|
//! | 0      | 4    | payload length (big-endian `u32`)  |
//! | 4      | 4    | CRC32 of the payload (big-endian)  |
//! | 8      | len  | native v1 rows                     |
//!
//! On open the file is memory-mapped and replayed. A torn or corrupt tail
//! (the process died mid-append) is cut off at the last intact record.
//!
//! When rows expire the storage rewrites the journal with the live rows only
//! ([`Journal::rewrite`]), so its size tracks the data still held.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use memmap2::Mmap;

use lh_core::native::unmarshal_rows;
use lh_core::DecodedRow;

use crate::error::StoreError;

/// Name of the journal file inside the storage directory.
pub const JOURNAL_FILE: &str = "journal.bin";

const HEADER_SIZE: usize = 8;

/// Largest payload a single record may carry.
pub const MAX_RECORD_SIZE: usize = u32::MAX as usize;

pub struct Journal {
    path: PathBuf,
    file: File,
    /// Current file length in bytes.
    size: u64,
}

impl Journal {
    /// Opens (or creates) the journal in `dir` and returns it together with
    /// every batch recorded so far, oldest first.
    pub fn open(dir: &Path) -> Result<(Self, Vec<Vec<DecodedRow>>), StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let (batches, valid_len) = if len == 0 {
            (Vec::new(), 0)
        } else {
            // SAFETY: the journal directory is owned by this process; nobody
            // else truncates the file while it is mapped. The map is dropped
            // before the file is modified below.
            let mmap = unsafe { Mmap::map(&file)? };
            replay(&mmap, &path)
        };

        if valid_len < len {
            tracing::warn!(
                "journal {:?}: dropping {} trailing bytes of a torn record",
                path,
                len - valid_len
            );
            file.set_len(valid_len)?;
        }

        Ok((
            Self {
                path,
                file,
                size: valid_len,
            },
            batches,
        ))
    }

    /// Appends one record and syncs it to disk.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), StoreError> {
        let record = frame(payload)?;
        self.file.write_all(&record)?;
        self.file.sync_data()?;
        self.size += record.len() as u64;
        Ok(())
    }

    /// Replaces the whole journal with `payloads`. The new records go to a
    /// temporary file that is synced and then renamed over the journal, so a
    /// crash leaves either the old or the new journal in place.
    pub fn rewrite<'a>(&mut self, payloads: impl IntoIterator<Item = &'a [u8]>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("bin.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut size = 0u64;
        for payload in payloads {
            let record = frame(payload)?;
            file.write_all(&record)?;
            size += record.len() as u64;
        }
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            File::open(dir)?.sync_all()?;
        }
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        tracing::debug!("journal {:?}: rewrote {} -> {} bytes", self.path, self.size, size);
        self.size = size;
        Ok(())
    }

    /// Current journal size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered data to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Header plus payload of one record.
fn frame(payload: &[u8]) -> Result<Vec<u8>, StoreError> {
    if payload.len() > MAX_RECORD_SIZE {
        return Err(StoreError::RecordTooLarge(payload.len()));
    }
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(payload);
    Ok(record)
}

/// Walks the records in `data`, returning the decoded batches and the byte
/// length of the intact prefix.
fn replay(data: &[u8], path: &Path) -> (Vec<Vec<DecodedRow>>, u64) {
    let mut batches = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_SIZE <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let checksum = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + HEADER_SIZE;
        let Some(payload) = data.get(start..start + len) else {
            break;
        };

        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != checksum {
            tracing::warn!("journal {:?}: checksum mismatch at offset {}", path, pos);
            break;
        }
        match unmarshal_rows(payload) {
            Ok(rows) => batches.push(rows),
            Err(e) => {
                tracing::warn!("journal {:?}: undecodable record at offset {}: {}", path, pos, e);
                break;
            }
        }
        pos = start + len;
    }
    (batches, pos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_core::{Field, LogRow};

    fn payload(msg: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        LogRow::new(1, vec![Field::new("_msg", msg)]).marshal(&mut buf);
        buf
    }

    #[test]
    fn test_appended_records_are_replayed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, batches) = Journal::open(dir.path()).unwrap();
            assert!(batches.is_empty());
            journal.append(&payload("first")).unwrap();
            journal.append(&payload("second")).unwrap();
        }
        let (_journal, batches) = Journal::open(dir.path()).unwrap();
        let msgs: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|r| r.other_fields[0].value.as_str())
            .collect();
        assert_eq!(msgs, vec!["first", "second"]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let good_size = {
            let (mut journal, _) = Journal::open(dir.path()).unwrap();
            journal.append(&payload("kept")).unwrap();
            let size = journal.size();
            journal.append(&payload("torn")).unwrap();
            size
        };
        let path = dir.path().join(JOURNAL_FILE);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_size + 5).unwrap();
        drop(file);

        let (journal, batches) = Journal::open(dir.path()).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(journal.size(), good_size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_size);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, _) = Journal::open(dir.path()).unwrap();
            journal.append(&payload("expired")).unwrap();
            journal.append(&payload("live")).unwrap();
            let before = journal.size();

            let live = payload("live");
            journal.rewrite([live.as_slice()]).unwrap();
            assert!(journal.size() < before);
            assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), journal.size());

            journal.append(&payload("after")).unwrap();
        }
        assert!(!dir.path().join("journal.bin.tmp").exists());

        let (journal, batches) = Journal::open(dir.path()).unwrap();
        let msgs: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|r| r.other_fields[0].value.as_str())
            .collect();
        assert_eq!(msgs, vec!["live", "after"]);
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), journal.size());
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, _) = Journal::open(dir.path()).unwrap();
            journal.append(&payload("ok")).unwrap();
            journal.append(&payload("flipped")).unwrap();
        }
        let path = dir.path().join(JOURNAL_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let (_journal, batches) = Journal::open(dir.path()).unwrap();
        assert_eq!(batches.len(), 1);
    }
}
