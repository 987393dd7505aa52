//! blockfs chunkserver core
//!
//! The block lifecycle subsystem of the data node: the in-memory block
//! registry backed by a persistent meta store, the pipelined write path,
//! the pull-replication engine, and the reporting loops that keep the
//! node reconciled with the nameserver.

pub mod block;
pub mod counters;
pub mod disk;
pub mod file_cache;
pub mod manager;
pub mod meta;
pub mod pool;
pub mod replica;
pub mod reporter;
pub mod rpc;
pub mod service;
pub mod web;

pub use block::Block;
pub use counters::Counters;
pub use manager::BlockManager;
pub use meta::{BlockMeta, MetaStore};
pub use service::ChunkServerImpl;

/// Chunkserver id before the nameserver has assigned one.
pub const UNKNOWN_CHUNKSERVER_ID: i32 = -1;

/// Microseconds since the Unix epoch; the clock the wire timestamps use.
pub fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
