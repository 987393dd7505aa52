//! Error types for blockfs
//!
//! Library code returns `Result<T>`; RPC handlers convert failures into
//! in-band wire codes via [`Error::status_code`] and never surface
//! transport errors to the caller.

use thiserror::Error;

use crate::status;

/// Common result type for blockfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockfs
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("meta store error: {0}")]
    MetaStore(String),

    #[error("block not found: #{block_id}")]
    BlockNotFound { block_id: i64 },

    #[error("block unavailable: #{block_id}")]
    BlockUnavailable { block_id: i64 },

    #[error("append rejected for #{block_id}: {reason}")]
    AppendRejected { block_id: i64, reason: String },

    #[error("busy: too many pending buffers")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a meta-store error
    pub fn meta(msg: impl Into<String>) -> Self {
        Self::MetaStore(msg.into())
    }

    /// Create an append-rejected error
    pub fn append_rejected(block_id: i64, reason: impl Into<String>) -> Self {
        Self::AppendRejected {
            block_id,
            reason: reason.into(),
        }
    }

    /// In-band wire status for this error (see [`crate::status`]).
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::BlockNotFound { .. } => status::NOT_FOUND,
            Self::Busy => status::BUSY,
            Self::AppendRejected { .. } => status::APPEND_REJECTED,
            Self::DiskIo(_) => status::READ_FAILED,
            // A block with no persisted identity is unavailable, whatever
            // the meta store said exactly.
            Self::MetaStore(_) | Self::BlockUnavailable { .. } => status::BLOCK_UNAVAILABLE,
            Self::Config(_) => status::BUSY,
        }
    }
}
