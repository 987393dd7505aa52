//! Process-wide counters
//!
//! Wait-free atomics used for reporting only; nothing here participates in
//! correctness decisions beyond write admission, which tolerates staleness.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// One monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: i64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn sub(&self, v: i64) {
        self.0.fetch_sub(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All chunkserver counters.
#[derive(Debug, Default)]
pub struct Counters {
    /// Blocks registered on this node
    pub blocks: Counter,
    /// Blocks with an open write window
    pub writing_blocks: Counter,
    /// Bytes currently parked in sliding windows
    pub writing_bytes: Counter,
    /// Out-of-order packets parked in sliding windows; admission input
    pub block_buffers: Counter,
    pub buffers_new: Counter,
    pub buffers_delete: Counter,
    /// Bytes durably appended across all blocks
    pub data_size: Counter,

    pub find_ops: Counter,
    pub read_ops: Counter,
    pub write_ops: Counter,
    pub write_bytes: Counter,
    pub refuse_ops: Counter,

    /// Sum of arrival-minus-client-stamp, microseconds
    pub rpc_delay: Counter,
    /// Sum of completion-minus-client-stamp, microseconds
    pub rpc_delay_all: Counter,
    pub rpc_count: Counter,

    last: Mutex<Snapshot>,
}

/// Raw counter values at one instant.
#[derive(Clone, Copy, Debug, Default)]
struct Snapshot {
    find_ops: i64,
    read_ops: i64,
    write_ops: i64,
    write_bytes: i64,
    refuse_ops: i64,
    buffers_new: i64,
    buffers_delete: i64,
    rpc_delay: i64,
    rpc_delay_all: i64,
    rpc_count: i64,
}

/// Per-gather deltas, for the status log line and the dashboard.
#[derive(Clone, Copy, Debug, Default)]
pub struct CounterRates {
    pub find_ops: i64,
    pub read_ops: i64,
    pub write_ops: i64,
    pub write_bytes: i64,
    pub refuse_ops: i64,
    pub buffers_new: i64,
    pub buffers_delete: i64,
    /// Mean arrival delay over the interval, microseconds
    pub rpc_delay: i64,
    /// Mean completion delay over the interval, microseconds
    pub rpc_delay_all: i64,
}

impl Counters {
    /// Take the delta since the previous gather.
    pub fn gather(&self) -> CounterRates {
        let now = Snapshot {
            find_ops: self.find_ops.get(),
            read_ops: self.read_ops.get(),
            write_ops: self.write_ops.get(),
            write_bytes: self.write_bytes.get(),
            refuse_ops: self.refuse_ops.get(),
            buffers_new: self.buffers_new.get(),
            buffers_delete: self.buffers_delete.get(),
            rpc_delay: self.rpc_delay.get(),
            rpc_delay_all: self.rpc_delay_all.get(),
            rpc_count: self.rpc_count.get(),
        };
        let mut last = self.last.lock();
        let rpcs = (now.rpc_count - last.rpc_count).max(1);
        let rates = CounterRates {
            find_ops: now.find_ops - last.find_ops,
            read_ops: now.read_ops - last.read_ops,
            write_ops: now.write_ops - last.write_ops,
            write_bytes: now.write_bytes - last.write_bytes,
            refuse_ops: now.refuse_ops - last.refuse_ops,
            buffers_new: now.buffers_new - last.buffers_new,
            buffers_delete: now.buffers_delete - last.buffers_delete,
            rpc_delay: (now.rpc_delay - last.rpc_delay) / rpcs,
            rpc_delay_all: (now.rpc_delay_all - last.rpc_delay_all) / rpcs,
        };
        *last = now;
        rates
    }
}
