//! # Storage topology
//!
//! Every place rows can be written to or read from implements
//! [`StorageBackend`]: the storage owned by this process, or a peer reached
//! over HTTP. [`Topology`] groups backends into shards of replicas and does
//! the fan-out.

use std::sync::Arc;

use futures_util::future::try_join_all;
use lh_core::native::NATIVE_VERSION;
use lh_core::StoredRow;
use lh_store::Storage;

use crate::error::BackendError;
use crate::select::plan::{self, PartialResult, RemoteQuery};

// =============================================================================
// Core Trait
// =============================================================================

#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Cheap admission check done before decoding a request.
    async fn can_write(&self) -> Result<(), BackendError>;

    /// Durably stores `rows`. Nothing is stored when an error is returned.
    async fn add_rows(&self, rows: Vec<StoredRow>) -> Result<(), BackendError>;

    async fn query(&self, q: &RemoteQuery) -> Result<PartialResult, BackendError>;

    async fn force_flush(&self) -> Result<(), BackendError>;
}

// =============================================================================
// Local
// =============================================================================

pub struct LocalStorage {
    storage: Arc<Storage>,
}

impl LocalStorage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn can_write(&self) -> Result<(), BackendError> {
        self.storage
            .can_write()
            .map_err(|e| BackendError::from_store(self.name(), e))
    }

    async fn add_rows(&self, rows: Vec<StoredRow>) -> Result<(), BackendError> {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.add_rows(rows))
            .await
            .map_err(|e| BackendError::Internal {
                node: self.name().into(),
                message: e.to_string(),
            })?
            .map_err(|e| BackendError::from_store(self.name(), e))
    }

    async fn query(&self, q: &RemoteQuery) -> Result<PartialResult, BackendError> {
        let storage = self.storage.clone();
        let q = q.clone();
        tokio::task::spawn_blocking(move || plan::execute(&storage, &q))
            .await
            .map_err(|e| BackendError::Internal {
                node: self.name().into(),
                message: e.to_string(),
            })
    }

    async fn force_flush(&self) -> Result<(), BackendError> {
        self.storage.force_flush();
        Ok(())
    }
}

// =============================================================================
// Remote
// =============================================================================

/// A storage node reached through its `/internal/*` endpoints.
pub struct RemoteStorage {
    addr: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteStorage {
    pub fn new(addr: impl Into<String>, client: reqwest::Client) -> Self {
        let addr = addr.into();
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Self {
            addr,
            base_url,
            client,
        }
    }

    fn unreachable(&self, source: reqwest::Error) -> BackendError {
        BackendError::Unreachable {
            node: self.addr.clone(),
            source,
        }
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(BackendError::CannotWrite {
                node: self.addr.clone(),
                message,
            });
        }
        Err(BackendError::Status {
            node: self.addr.clone(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for RemoteStorage {
    fn name(&self) -> &str {
        &self.addr
    }

    async fn can_write(&self) -> Result<(), BackendError> {
        let resp = self
            .client
            .get(format!("{}/internal/can_write", self.base_url))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(resp).await?;
        Ok(())
    }

    async fn add_rows(&self, rows: Vec<StoredRow>) -> Result<(), BackendError> {
        let mut body = Vec::with_capacity(rows.len() * 64);
        for row in &rows {
            row.marshal(&mut body);
        }
        let resp = self
            .client
            .post(format!("{}/internal/insert", self.base_url))
            .query(&[("version", NATIVE_VERSION)])
            .body(body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(resp).await?;
        Ok(())
    }

    async fn query(&self, q: &RemoteQuery) -> Result<PartialResult, BackendError> {
        let resp = self
            .client
            .post(format!("{}/internal/select/query", self.base_url))
            .json(q)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(resp)
            .await?
            .json::<PartialResult>()
            .await
            .map_err(|e| BackendError::BadResponse {
                node: self.addr.clone(),
                message: e.to_string(),
            })
    }

    async fn force_flush(&self) -> Result<(), BackendError> {
        let resp = self
            .client
            .get(format!("{}/internal/force_flush", self.base_url))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        self.check(resp).await?;
        Ok(())
    }
}

// =============================================================================
// Topology
// =============================================================================

/// Backends grouped into shards; each shard holds `replication_factor`
/// replicas with identical data.
pub struct Topology {
    shards: Vec<Vec<Arc<dyn StorageBackend>>>,
}

impl Topology {
    /// Consecutive backends form a shard. A trailing partial group becomes a
    /// shard of its own.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, replication_factor: usize) -> Self {
        let shards = backends
            .chunks(replication_factor.max(1))
            .map(|c| c.to_vec())
            .collect();
        Self { shards }
    }

    pub fn local(storage: Arc<Storage>) -> Self {
        Self::new(vec![Arc::new(LocalStorage::new(storage))], 1)
    }

    pub fn remote(addrs: &[String], replication_factor: usize) -> Self {
        let client = reqwest::Client::new();
        let backends = addrs
            .iter()
            .map(|a| Arc::new(RemoteStorage::new(a.clone(), client.clone())) as Arc<dyn StorageBackend>)
            .collect();
        Self::new(backends, replication_factor)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn StorageBackend>> {
        self.shards.iter().flatten()
    }

    /// Asks every backend whether it accepts writes. Any refusal rejects
    /// the request before a single row reaches a shard.
    pub async fn can_write(&self) -> Result<(), BackendError> {
        try_join_all(self.all().map(|b| b.can_write())).await?;
        Ok(())
    }

    /// Routes every row to the shard picked by its stream id and writes it to
    /// all replicas of that shard. Rows keep their request order within a
    /// shard. The first failure fails the whole write.
    pub async fn write(&self, rows: Vec<StoredRow>) -> Result<(), BackendError> {
        let n = self.shards.len();
        if n == 0 || rows.is_empty() {
            return Ok(());
        }
        let mut per_shard: Vec<Vec<StoredRow>> = vec![Vec::new(); n];
        for row in rows {
            per_shard[row.stream_id().shard(n)].push(row);
        }
        let writes = per_shard
            .into_iter()
            .zip(&self.shards)
            .filter(|(rows, _)| !rows.is_empty())
            .flat_map(|(rows, replicas)| replicas.iter().map(move |r| r.add_rows(rows.clone())));
        try_join_all(writes).await?;
        Ok(())
    }

    /// Runs `q` on the first replica of every shard. Any failure fails the
    /// query and drops the other in-flight requests.
    pub async fn query(&self, q: &RemoteQuery) -> Result<Vec<PartialResult>, BackendError> {
        try_join_all(self.shards.iter().filter_map(|s| s.first()).map(|b| b.query(q))).await
    }

    pub async fn force_flush(&self) -> Result<(), BackendError> {
        try_join_all(self.all().map(|b| b.force_flush())).await?;
        Ok(())
    }
}
