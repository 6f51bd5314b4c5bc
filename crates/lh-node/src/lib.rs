//! # Loggerhead node
//!
//! One binary, three roles. A node with no `--storage-node` flags stores
//! data itself; otherwise it shards writes and fans out queries across the
//! listed storage nodes.

pub mod config;
pub mod error;
pub mod insert;
pub mod logsql;
pub mod metrics;
pub mod select;
pub mod server;
pub mod topology;

pub use config::{Args, NodeConfig, Role};
pub use server::{start, Node, ServeError};
