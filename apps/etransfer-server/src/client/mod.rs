//! Client library
//!
//! `TransferClient` drives resumable uploads and chunked downloads against a
//! server, choosing its endpoint once per operation through
//! `EndpointSelector`.

mod selector;
mod transfer;

pub use selector::{
    compare, Candidate, EndpointProbe, EndpointSelector, HttpProber, DEFAULT_PROBE_TIMEOUT,
};
pub use transfer::{ClientOptions, DownloadReport, TransferClient, UploadReport};

/// Client error types
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server returned {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage still full after waiting {waited_secs}s")]
    QuotaTimeout { waited_secs: u64 },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ClientError {
    /// HTTP status of a server rejection
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
