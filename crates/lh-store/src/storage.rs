//! # Storage: flush-gated row sets
//!
//! Rows go through three states:
//!
//! 1. **journaled**: appended and synced by [`Storage::add_rows`]; the call
//!    returns only after this point.
//! 2. **pending**: buffered in memory, invisible to searches.
//! 3. **visible**: moved into an immutable part by [`Storage::force_flush`]
//!    (or the caller's periodic flush).
//!
//! Parts are sorted by `(stream_id, timestamp)` and shared as `Arc`s, so a
//! search works on a snapshot and never blocks ingestion.
//!
//! Retention runs at open and at flush. Whenever it drops rows the journal
//! is rewritten with the remaining ones, so `max_disk_bytes` is measured
//! against live data.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use lh_core::{now_nanos, StoredRow};

use crate::error::StoreError;
use crate::journal::Journal;

/// Parts beyond this count are merged into one at flush time.
const MAX_PARTS: usize = 16;

/// Rows per journal record when the journal is rewritten.
const REWRITE_BATCH_ROWS: usize = 4096;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Rows older than this are dropped at open and at flush.
    pub retention: Duration,
    /// Journal size at which writes are refused. `0` disables the check.
    pub max_disk_bytes: u64,
    pub read_only: bool,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retention: Duration::from_secs(7 * 24 * 3600),
            max_disk_bytes: 0,
            read_only: false,
        }
    }
}

/// An immutable, sorted batch of visible rows.
#[derive(Debug)]
struct Part {
    rows: Vec<StoredRow>,
    min_ts: i64,
    max_ts: i64,
}

impl Part {
    fn new(mut rows: Vec<StoredRow>) -> Self {
        rows.sort_by(|a, b| (a.stream_id(), a.timestamp).cmp(&(b.stream_id(), b.timestamp)));
        let min_ts = rows.iter().map(|r| r.timestamp).min().unwrap_or(i64::MAX);
        let max_ts = rows.iter().map(|r| r.timestamp).max().unwrap_or(i64::MIN);
        Self { rows, min_ts, max_ts }
    }
}

/// Point-in-time counters for `/metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub pending_rows: u64,
    pub visible_rows: u64,
    pub parts: u64,
    pub journal_bytes: u64,
    pub rows_added_total: u64,
}

pub struct Storage {
    config: StorageConfig,
    journal: Mutex<Journal>,
    pending: Mutex<Vec<StoredRow>>,
    visible: RwLock<Vec<Arc<Part>>>,
    /// Serializes flushes; a rewrite must see every taken row in `visible`.
    flush: Mutex<()>,
    read_only: AtomicBool,
    rows_added: AtomicU64,
}

impl Storage {
    /// Opens the storage directory, replaying the journal. Replayed rows are
    /// visible immediately.
    pub fn open(config: StorageConfig) -> Result<Self, StoreError> {
        tracing::info!("opening storage at -storageDataPath={}", config.path.display());
        let (mut journal, batches) = Journal::open(&config.path)?;

        let cutoff = retention_cutoff(config.retention);
        let replayed: Vec<StoredRow> = batches
            .into_iter()
            .flatten()
            .map(|row| StoredRow::from_decoded(row, 0))
            .collect();
        let total = replayed.len();
        let rows: Vec<StoredRow> = replayed.into_iter().filter(|row| row.timestamp >= cutoff).collect();
        if rows.len() < total {
            tracing::info!("dropping {} rows outside the retention period", total - rows.len());
            rewrite_journal(&mut journal, rows.iter())?;
        }
        tracing::info!(
            "replayed {} rows from {} ({} bytes)",
            rows.len(),
            journal.path().display(),
            journal.size()
        );

        let visible = if rows.is_empty() {
            Vec::new()
        } else {
            vec![Arc::new(Part::new(rows))]
        };

        Ok(Self {
            read_only: AtomicBool::new(config.read_only),
            config,
            journal: Mutex::new(journal),
            pending: Mutex::new(Vec::new()),
            visible: RwLock::new(visible),
            flush: Mutex::new(()),
            rows_added: AtomicU64::new(0),
        })
    }

    /// Checks whether the storage accepts writes right now.
    pub fn can_write(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(StoreError::CannotWrite("storage is in read-only mode".into()));
        }
        if self.config.max_disk_bytes > 0 {
            let size = self.journal_size();
            if size >= self.config.max_disk_bytes {
                return Err(StoreError::CannotWrite(format!(
                    "journal size {} bytes reached the limit of {} bytes",
                    size, self.config.max_disk_bytes
                )));
            }
        }
        Ok(())
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Makes `rows` durable, then buffers them until the next flush.
    ///
    /// Either the whole batch is journaled or none of it is.
    pub fn add_rows(&self, rows: Vec<StoredRow>) -> Result<(), StoreError> {
        self.can_write()?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(rows.len() * 64);
        for row in &rows {
            row.marshal(&mut payload);
        }

        // Journal and pending are appended under the journal lock so that
        // pending order matches journal order.
        let mut journal = lock(&self.journal);
        journal.append(&payload)?;
        let n = rows.len() as u64;
        lock(&self.pending).extend(rows);
        drop(journal);

        self.rows_added.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    /// Moves every pending row into a visible part and applies retention.
    /// Returns the number of rows made visible. Calling it again with no
    /// writes in between changes nothing.
    pub fn force_flush(&self) -> usize {
        let _flush = lock(&self.flush);
        let rows = std::mem::take(&mut *lock(&self.pending));
        let flushed = rows.len();
        let cutoff = retention_cutoff(self.config.retention);

        let mut visible = self.visible.write().unwrap_or_else(|e| e.into_inner());
        if !rows.is_empty() {
            visible.push(Arc::new(Part::new(rows)));
        }

        let expired = visible.iter().any(|p| p.min_ts < cutoff);
        if expired || visible.len() > MAX_PARTS {
            let before: usize = visible.iter().map(|p| p.rows.len()).sum();
            let merged: Vec<StoredRow> = visible
                .iter()
                .flat_map(|p| p.rows.iter())
                .filter(|r| r.timestamp >= cutoff)
                .cloned()
                .collect();
            if merged.len() < before {
                tracing::info!("dropped {} rows outside the retention period", before - merged.len());
            }
            visible.clear();
            if !merged.is_empty() {
                visible.push(Arc::new(Part::new(merged)));
            }
        }
        drop(visible);

        if expired {
            if let Err(e) = self.compact_journal() {
                tracing::warn!("cannot rewrite journal after retention: {}", e);
            }
        }
        if flushed > 0 {
            tracing::debug!("flushed {} rows", flushed);
        }
        flushed
    }

    /// Rewrites the journal with the visible and pending rows. The journal
    /// lock keeps writers out, so no acknowledged row is lost.
    fn compact_journal(&self) -> Result<(), StoreError> {
        let mut journal = lock(&self.journal);
        let pending = lock(&self.pending);
        let parts: Vec<Arc<Part>> = self
            .visible
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        rewrite_journal(&mut journal, parts.iter().flat_map(|p| p.rows.iter()).chain(pending.iter()))
    }

    /// Calls `f` for every visible row with `min_ts <= timestamp <= max_ts`.
    /// Rows come part by part, each part in `(stream_id, timestamp)` order.
    pub fn search(&self, min_ts: i64, max_ts: i64, mut f: impl FnMut(&StoredRow)) {
        let parts: Vec<Arc<Part>> = self
            .visible
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for part in parts {
            if part.max_ts < min_ts || part.min_ts > max_ts {
                continue;
            }
            for row in &part.rows {
                if row.timestamp >= min_ts && row.timestamp <= max_ts {
                    f(row);
                }
            }
        }
    }

    pub fn stats(&self) -> StorageStats {
        let journal_bytes = self.journal_size();
        let pending_rows = lock(&self.pending).len() as u64;
        let visible = self.visible.read().unwrap_or_else(|e| e.into_inner());
        StorageStats {
            pending_rows,
            visible_rows: visible.iter().map(|p| p.rows.len() as u64).sum(),
            parts: visible.len() as u64,
            journal_bytes,
            rows_added_total: self.rows_added.load(Ordering::Relaxed),
        }
    }

    /// Flushes pending rows and syncs the journal. Used at shutdown.
    pub fn close(&self) -> Result<(), StoreError> {
        self.force_flush();
        lock(&self.journal).sync()
    }

    fn journal_size(&self) -> u64 {
        lock(&self.journal).size()
    }
}

fn rewrite_journal<'a>(journal: &mut Journal, rows: impl Iterator<Item = &'a StoredRow>) -> Result<(), StoreError> {
    let rows: Vec<&StoredRow> = rows.collect();
    let payloads: Vec<Vec<u8>> = rows
        .chunks(REWRITE_BATCH_ROWS)
        .map(|chunk| {
            let mut payload = Vec::with_capacity(chunk.len() * 64);
            for row in chunk {
                row.marshal(&mut payload);
            }
            payload
        })
        .collect();
    journal.rewrite(payloads.iter().map(Vec::as_slice))
}

fn retention_cutoff(retention: Duration) -> i64 {
    let retention = i64::try_from(retention.as_nanos()).unwrap_or(i64::MAX);
    now_nanos().saturating_sub(retention)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
