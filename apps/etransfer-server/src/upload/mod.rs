//! Resumable Upload Module (tus 1.0.0)
//!
//! Implements reliable large file uploads with:
//! - Offset-addressed chunk appends with idempotent replay
//! - Optional per-chunk checksums (sha1, sha256, md5)
//! - Deferred-length uploads completed by an explicit finalize
//!
//! Protocol Flow:
//! 1. Client creates an upload (POST), optionally with the first chunk
//! 2. Client asks for the committed offset (HEAD) after any interruption
//! 3. Client appends chunks from that offset (PATCH) until complete

pub mod checksum;
pub mod engine;
pub mod metadata;
pub mod types;

pub use checksum::{ChecksumAlgorithm, ChunkChecksum};
pub use engine::{EngineOptions, Reclaim, UploadEngine};
pub use metadata::{encode_metadata, parse_metadata};
pub use types::*;
