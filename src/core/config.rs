use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::errors::Result;

/// Node configuration.
///
/// Loaded from a JSON file at boot; every field has a stock default so a
/// config file only needs to name the keys it overrides. Builder-style
/// setters cover embedded use.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding `active.log` (all nodes) and `xa.log` (coordinators).
    pub log_dir: PathBuf,
    /// Max bytes in an active log file before archival is triggered.
    pub target_log_size: u64,
    /// Idle poll interval for the background log flusher, in seconds.
    pub log_clean_sleep_secs: u64,
    /// TCP listener port on every node.
    pub port_number: u16,
    /// Branching factor of the broadcast spanning tree.
    pub max_neighbor_nodes: usize,
    /// Max rows batched per flush group in the DML executor.
    pub max_batch: usize,
    /// Pages requested per prefetch call during mass-delete scans.
    pub prefetch_request_size: usize,
    /// Prefetch refill threshold during mass-delete scans.
    pub pages_in_advance: usize,
    /// Comma-separated device roots on this node.
    pub data_directories: String,
    /// This node's id in the cluster roster (owns the `node` field of RIDs).
    pub node_id: i32,
    /// Coordinator nodes own an XA decision log.
    pub coordinator: bool,
    /// Socket connect timeout for tree broadcasts, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Socket read timeout for tree broadcasts, in milliseconds.
    pub read_timeout_ms: u64,
    /// Base blacklist expiry; doubles per consecutive failure.
    pub blacklist_base_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            target_log_size: 64 * 1024 * 1024,
            log_clean_sleep_secs: 1,
            port_number: 3232,
            max_neighbor_nodes: 4,
            max_batch: 5000,
            prefetch_request_size: 80,
            pages_in_advance: 40,
            data_directories: String::from("data"),
            node_id: 0,
            coordinator: false,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            blacklist_base_secs: 5,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn target_log_size(mut self, bytes: u64) -> Self {
        self.target_log_size = bytes;
        self
    }

    pub fn port_number(mut self, port: u16) -> Self {
        self.port_number = port;
        self
    }

    pub fn max_neighbor_nodes(mut self, max: usize) -> Self {
        self.max_neighbor_nodes = max;
        self
    }

    pub fn node_id(mut self, id: i32) -> Self {
        self.node_id = id;
        self
    }

    pub fn coordinator(mut self, coordinator: bool) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn data_directories<S: Into<String>>(mut self, dirs: S) -> Self {
        self.data_directories = dirs.into();
        self
    }

    /// Parsed device roots, in device-number order.
    pub fn data_dirs(&self) -> Vec<PathBuf> {
        self.data_directories
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    /// Path of the node-local write-ahead log.
    pub fn active_log_path(&self) -> PathBuf {
        self.log_dir.join("active.log")
    }

    /// Path of the XA decision log (coordinators only).
    pub fn xa_log_path(&self) -> PathBuf {
        self.log_dir.join("xa.log")
    }
}
