//! blockfs protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for blockfs's
//! internal gRPC services.

/// Chunkserver service (block reads and pipelined writes)
pub mod chunkserver {
    tonic::include_proto!("blockfs.chunkserver");
}

/// Nameserver service (heartbeat and block reports, outbound only)
pub mod nameserver {
    tonic::include_proto!("blockfs.nameserver");
}
