//! Byte storage backing upload sessions
//!
//! Each session owns exactly one blob. Bytes below the session's committed
//! offset are immutable; anything past it is garbage from an interrupted
//! write and is truncated by the next append.

mod blob_store;

pub use blob_store::{BlobStorage, BlobStore, LocalBlobStorage, MemoryBlobStorage};

/// Blob store error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob id: {0}")]
    InvalidId(String),

    #[error("Short read on {id}: wanted {wanted} bytes at {offset}")]
    ShortRead { id: String, offset: u64, wanted: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
