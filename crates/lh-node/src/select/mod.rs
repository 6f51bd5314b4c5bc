//! # Query execution
//!
//! Scatter the remote part of a plan to every shard, gather the partial
//! results, merge them and run the local pipes. A query either completes
//! over all shards or fails; there is no partial answer.

pub mod handlers;
pub mod plan;

use std::time::Duration;

use crate::error::QueryError;
use crate::logsql::{apply_pipes, Query, QueryRow};
use crate::topology::Topology;

pub async fn run_query(topology: &Topology, query: Query, timeout: Duration) -> Result<Vec<QueryRow>, QueryError> {
    let plan = plan::split(query);
    let partials = tokio::time::timeout(timeout, topology.query(&plan.remote))
        .await
        .map_err(|_| QueryError::Timeout(timeout))??;
    let rows = plan::merge(plan.remote.terminal.as_ref(), partials)?;
    Ok(apply_pipes(rows, &plan.local))
}
