//! Chunkserver configuration
//!
//! All knobs live in one flat structure so a TOML file maps 1:1 onto the
//! historical flag names. Every field has a serde default; an empty file
//! (or no file) yields a runnable local configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Chunkserver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkServerConfig {
    /// Comma-separated list of store directories
    #[serde(default = "default_block_store_path")]
    pub block_store_path: String,

    /// Nameserver host
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Nameserver port
    #[serde(default = "default_nameserver_port")]
    pub nameserver_port: u16,

    /// Port this chunkserver listens on
    #[serde(default = "default_chunkserver_port")]
    pub chunkserver_port: u16,

    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Seconds between block-report cycles
    #[serde(default = "default_blockreport_interval")]
    pub blockreport_interval: u64,

    /// Maximum blocks per report batch
    #[serde(default = "default_blockreport_size")]
    pub blockreport_size: usize,

    /// Per-packet write buffer size in bytes
    #[serde(default = "default_write_buf_size")]
    pub write_buf_size: usize,

    /// Admission limit: writes are refused when either the buffered packet
    /// count or the work-pool backlog exceeds this
    #[serde(default = "default_max_pending_buffers")]
    pub chunkserver_max_pending_buffers: i64,

    #[serde(default = "default_work_thread_num")]
    pub chunkserver_work_thread_num: usize,

    #[serde(default = "default_read_thread_num")]
    pub chunkserver_read_thread_num: usize,

    #[serde(default = "default_write_thread_num")]
    pub chunkserver_write_thread_num: usize,

    /// Capacity of the open-file-handle cache
    #[serde(default = "default_file_cache_size")]
    pub chunkserver_file_cache_size: usize,
}

fn default_block_store_path() -> String {
    "./data".to_string()
}

fn default_nameserver() -> String {
    "127.0.0.1".to_string()
}

fn default_nameserver_port() -> u16 {
    8828
}

fn default_chunkserver_port() -> u16 {
    8825
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_blockreport_interval() -> u64 {
    10
}

fn default_blockreport_size() -> usize {
    20000
}

fn default_write_buf_size() -> usize {
    256 * 1024
}

fn default_max_pending_buffers() -> i64 {
    10240
}

fn default_work_thread_num() -> usize {
    10
}

fn default_read_thread_num() -> usize {
    10
}

fn default_write_thread_num() -> usize {
    10
}

fn default_file_cache_size() -> usize {
    1000
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("all fields have defaults")
    }
}

impl ChunkServerConfig {
    /// Parse a TOML configuration string.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::DiskIo(e)),
        }
    }

    /// `host:port` address of the nameserver.
    pub fn nameserver_addr(&self) -> String {
        format!("{}:{}", self.nameserver, self.nameserver_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = ChunkServerConfig::default();
        assert_eq!(cfg.block_store_path, "./data");
        assert_eq!(cfg.chunkserver_port, 8825);
        assert!(cfg.chunkserver_max_pending_buffers > 0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = ChunkServerConfig::from_toml(
            "block_store_path = \"/a,/b\"\nchunkserver_max_pending_buffers = 0\n",
        )
        .unwrap();
        assert_eq!(cfg.block_store_path, "/a,/b");
        assert_eq!(cfg.chunkserver_max_pending_buffers, 0);
        assert_eq!(cfg.blockreport_size, 20000);
    }

    #[test]
    fn missing_file_is_defaults() {
        let cfg = ChunkServerConfig::load("/nonexistent/chunkserver.toml").unwrap();
        assert_eq!(cfg.nameserver_port, 8828);
    }

    #[test]
    fn nameserver_addr_joins_host_and_port() {
        let mut cfg = ChunkServerConfig::default();
        cfg.nameserver = "ns.example".into();
        cfg.nameserver_port = 9000;
        assert_eq!(cfg.nameserver_addr(), "ns.example:9000");
    }
}
