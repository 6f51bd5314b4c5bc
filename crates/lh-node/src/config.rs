//! # Node configuration
//!
//! Topology, addresses and paths come from command-line flags; tunables come
//! from an optional TOML file. Flags override the file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde::Deserialize;

pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "lhnode", version, about = "Loggerhead log storage node")]
pub struct Args {
    /// Address to serve HTTP on
    #[arg(long, default_value = "127.0.0.1:9428")]
    pub http_listen_addr: String,

    /// Directory holding the local storage
    #[arg(long, default_value = "lh-data")]
    pub storage_data_path: PathBuf,

    /// Rows older than this are dropped, e.g. `7d`
    #[arg(long)]
    pub retention_period: Option<String>,

    /// Storage node addresses (host:port). Empty means this node stores
    /// data itself.
    #[arg(long = "storage-node", value_delimiter = ',')]
    pub storage_nodes: Vec<String>,

    /// Number of replicas per shard; the storage node count must be a
    /// multiple of it
    #[arg(long, default_value_t = DEFAULT_REPLICATION_FACTOR)]
    pub replication_factor: usize,

    /// Disable the /insert/* endpoints
    #[arg(long, action = ArgAction::Set, default_value_t = false, num_args = 0..=1, default_missing_value = "true")]
    pub insert_disable: bool,

    /// Disable the /select/* endpoints
    #[arg(long, action = ArgAction::Set, default_value_t = false, num_args = 0..=1, default_missing_value = "true")]
    pub select_disable: bool,

    /// Maximum size of an ingestion request body, e.g. `64MiB`
    #[arg(long)]
    pub max_request_size: Option<String>,

    /// Reject writes on the local storage
    #[arg(long, action = ArgAction::Set, default_value_t = false, num_args = 0..=1, default_missing_value = "true")]
    pub read_only: bool,

    /// Path to config file
    #[arg(long, default_value = "lhnode.toml")]
    pub config: PathBuf,
}

// =============================================================================
// File config
// =============================================================================

#[derive(Deserialize, Default, Clone, Debug)]
pub struct FileConfig {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub insert: InsertSection,
    #[serde(default)]
    pub select: SelectSection,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageSection {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_retention")]
    pub retention: String,
    #[serde(default)]
    pub max_disk_bytes: u64,
    #[serde(default)]
    pub read_only: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            retention: default_retention(),
            max_disk_bytes: 0,
            read_only: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct InsertSection {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u64,
}

impl Default for InsertSection {
    fn default() -> Self {
        Self {
            max_request_size: default_max_request_size(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct SelectSection {
    #[serde(default = "default_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for SelectSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout(),
        }
    }
}

fn default_flush_interval() -> u64 {
    1000
}
fn default_retention() -> String {
    "7d".into()
}
fn default_max_request_size() -> u64 {
    64 * 1024 * 1024
}
fn default_timeout() -> u64 {
    30_000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid {flag}={value:?}: {reason}")]
    Invalid {
        flag: &'static str,
        value: String,
        reason: String,
    },
}

// =============================================================================
// Resolved config
// =============================================================================

/// What a node does, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns a local storage and serves every enabled endpoint against it.
    Storage,
    /// Stateless; routes to remote storage nodes.
    Router,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub data_path: PathBuf,
    pub retention: Duration,
    pub storage_nodes: Vec<String>,
    pub replication_factor: usize,
    pub insert_enabled: bool,
    pub select_enabled: bool,
    pub max_request_size: usize,
    pub read_only: bool,
    pub max_disk_bytes: u64,
    pub flush_interval: Duration,
    pub default_timeout: Duration,
}

impl NodeConfig {
    /// A storage node with defaults, listening on `listen_addr`.
    pub fn storage(listen_addr: impl Into<String>, data_path: impl Into<PathBuf>) -> Self {
        let file = FileConfig::default();
        Self {
            listen_addr: listen_addr.into(),
            data_path: data_path.into(),
            retention: Duration::from_secs(7 * 24 * 3600),
            storage_nodes: Vec::new(),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            insert_enabled: true,
            select_enabled: true,
            max_request_size: file.insert.max_request_size as usize,
            read_only: false,
            max_disk_bytes: 0,
            flush_interval: Duration::from_millis(file.storage.flush_interval_ms),
            default_timeout: Duration::from_millis(file.select.default_timeout_ms),
        }
    }

    /// A stateless node routing to `storage_nodes`.
    pub fn router(listen_addr: impl Into<String>, storage_nodes: Vec<String>) -> Self {
        Self {
            storage_nodes,
            ..Self::storage(listen_addr, PathBuf::new())
        }
    }

    pub fn role(&self) -> Role {
        if self.storage_nodes.is_empty() {
            Role::Storage
        } else {
            Role::Router
        }
    }

    /// Merges flags over the file config found at `args.config`. A missing
    /// file means defaults.
    pub fn load(args: Args) -> Result<Self, ConfigError> {
        let file = if args.config.exists() {
            let path = args.config.display().to_string();
            let content = std::fs::read_to_string(&args.config).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            FileConfig::default()
        };
        Self::resolve(args, file)
    }

    pub fn resolve(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        let retention_text = args.retention_period.unwrap_or(file.storage.retention);
        let retention = crate::logsql::parse_duration(&retention_text)
            .filter(|d| *d > 0)
            .map(|d| Duration::from_nanos(d as u64))
            .ok_or_else(|| ConfigError::Invalid {
                flag: "retention-period",
                value: retention_text.clone(),
                reason: "expected a positive duration such as 7d".into(),
            })?;

        let max_request_size = match args.max_request_size {
            Some(text) => parse_bytes(&text).ok_or_else(|| ConfigError::Invalid {
                flag: "max-request-size",
                value: text.clone(),
                reason: "expected a size such as 64MiB".into(),
            })?,
            None => file.insert.max_request_size,
        };

        let storage_nodes: Vec<String> = args
            .storage_nodes
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let replication_factor = args.replication_factor;
        if replication_factor == 0 {
            return Err(ConfigError::Invalid {
                flag: "replication-factor",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !storage_nodes.is_empty() && storage_nodes.len() % replication_factor != 0 {
            return Err(ConfigError::Invalid {
                flag: "replication-factor",
                value: replication_factor.to_string(),
                reason: format!(
                    "the {} storage nodes cannot be split into groups of this size",
                    storage_nodes.len()
                ),
            });
        }

        Ok(Self {
            listen_addr: args.http_listen_addr,
            data_path: args.storage_data_path,
            retention,
            storage_nodes,
            replication_factor,
            insert_enabled: !args.insert_disable,
            select_enabled: !args.select_disable,
            max_request_size: max_request_size as usize,
            read_only: args.read_only || file.storage.read_only,
            max_disk_bytes: file.storage.max_disk_bytes,
            flush_interval: Duration::from_millis(file.storage.flush_interval_ms.max(1)),
            default_timeout: Duration::from_millis(file.select.default_timeout_ms.max(1)),
        })
    }
}

/// Parses `1024`, `64KB`, `64MiB`, `1GiB` and friends.
pub fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let mul: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        _ => return None,
    };
    n.checked_mul(mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["lhnode"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::resolve(args(&[]), FileConfig::default()).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9428");
        assert_eq!(cfg.role(), Role::Storage);
        assert_eq!(cfg.max_request_size, 64 * 1024 * 1024);
        assert_eq!(cfg.retention, Duration::from_secs(7 * 24 * 3600));
        assert!(cfg.insert_enabled && cfg.select_enabled);
        assert_eq!(cfg.replication_factor, 3);
    }

    #[test]
    fn test_router_flags() {
        let cfg = NodeConfig::resolve(
            args(&["--storage-node=a:1,b:2,c:3", "--select-disable=true"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(cfg.role(), Role::Router);
        assert_eq!(cfg.storage_nodes, vec!["a:1", "b:2", "c:3"]);
        assert_eq!(cfg.replication_factor, 3);
        assert!(cfg.insert_enabled);
        assert!(!cfg.select_enabled);
    }

    #[test]
    fn test_bare_disable_flag() {
        let cfg = NodeConfig::resolve(args(&["--insert-disable"]), FileConfig::default()).unwrap();
        assert!(!cfg.insert_enabled);
    }

    #[test]
    fn test_replication_factor_must_divide_nodes() {
        let err = NodeConfig::resolve(
            args(&["--storage-node=a:1,b:2,c:3", "--replication-factor=2"]),
            FileConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("replication-factor"));

        // Two nodes cannot form a shard of the default three replicas.
        assert!(NodeConfig::resolve(args(&["--storage-node=a:1,b:2"]), FileConfig::default()).is_err());

        let cfg = NodeConfig::resolve(
            args(&["--storage-node=a:1,b:2", "--replication-factor=1"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(cfg.replication_factor, 1);
    }

    #[test]
    fn test_file_values_and_flag_override() {
        let file: FileConfig = toml::from_str(
            "[storage]\nflush_interval_ms = 250\nretention = \"1d\"\n[insert]\nmax_request_size = 100\n",
        )
        .unwrap();
        let cfg = NodeConfig::resolve(args(&["--max-request-size=1KiB"]), file).unwrap();
        assert_eq!(cfg.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.retention, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.max_request_size, 1024);
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("64MiB"), Some(64 << 20));
        assert_eq!(parse_bytes("10KB"), Some(10_000));
        assert_eq!(parse_bytes("512"), Some(512));
        assert_eq!(parse_bytes("lots"), None);
    }
}
