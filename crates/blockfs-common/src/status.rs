//! In-band RPC status codes
//!
//! These ride in the `status` field of the wire responses. The numeric
//! values are part of the protocol; clients key retry behavior off them.

/// Success
pub const OK: i32 = 0;

/// Block absent on this node; never retried locally
pub const NOT_FOUND: i32 = 404;

/// Backpressure: admission control refused the write, client should retry
pub const BUSY: i32 = 500;

/// Sliding window refused the packet (bad offset, at/past declared last)
pub const APPEND_REJECTED: i32 = 812;

/// Disk error while reading
pub const READ_FAILED: i32 = 882;

/// Block handle could not be created (metadata persistence failed)
pub const BLOCK_UNAVAILABLE: i32 = 8404;
