//! # lh-store: the storage engine contract
//!
//! Accepts classified rows, makes them durable before acknowledging, and
//! exposes them to queries only after a flush.
//!
//! - [`journal`]: checksummed append-only row log, replayed on open.
//! - [`storage`]: pending/visible row sets, force flush, retention and
//!   write backpressure.

pub mod error;
pub mod journal;
pub mod storage;

pub use error::StoreError;
pub use storage::{Storage, StorageConfig, StorageStats};
