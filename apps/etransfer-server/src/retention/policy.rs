//! Retention policies
//!
//! A policy is resolved exactly once, when the upload is created, from
//! (in priority order) the explicit request value, the caller's credential
//! profile default, and the server-wide default.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Rule governing automatic deletion of a completed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Kept until explicitly deleted
    #[default]
    Permanent,
    /// Deleted right after the first complete end-to-end download
    DownloadOnce,
    /// Deleted once `ttl_secs` have elapsed since completion
    Ttl { ttl_secs: u64 },
}

impl RetentionPolicy {
    /// Wire name used in headers and metadata
    pub fn name(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::DownloadOnce => "download_once",
            Self::Ttl { .. } => "ttl",
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Ttl { ttl_secs } => Some(Duration::seconds(*ttl_secs as i64)),
            _ => None,
        }
    }

    /// When a file completed at `completed_at` becomes eligible for deletion
    pub fn expires_at(&self, completed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl().map(|ttl| completed_at + ttl)
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ttl { ttl_secs } => write!(f, "ttl({}s)", ttl_secs),
            other => f.write_str(other.name()),
        }
    }
}

/// Policy kind without its parameters, as named by clients and profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    Permanent,
    DownloadOnce,
    Ttl,
}

impl RetentionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::DownloadOnce => "download_once",
            Self::Ttl => "ttl",
        }
    }
}

impl FromStr for RetentionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permanent" => Ok(Self::Permanent),
            "download_once" => Ok(Self::DownloadOnce),
            "ttl" => Ok(Self::Ttl),
            other => Err(format!("unknown retention policy: {}", other)),
        }
    }
}

/// A partially specified policy: a kind plus an optional TTL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRequest {
    pub kind: Option<RetentionKind>,
    pub ttl_secs: Option<u64>,
}

impl RetentionRequest {
    pub fn new(kind: Option<RetentionKind>, ttl_secs: Option<u64>) -> Self {
        Self { kind, ttl_secs }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.ttl_secs.is_none()
    }
}

/// Resolve the effective policy.
///
/// The first source that names a kind decides the kind. A TTL duration is
/// taken from the first source that carries one, starting at the source
/// that decided the kind. A TTL policy with no duration anywhere degrades
/// to `Permanent`.
pub fn resolve(
    explicit: &RetentionRequest,
    profile: &RetentionRequest,
    global: &RetentionRequest,
) -> RetentionPolicy {
    let sources = [explicit, profile, global];

    let Some((index, kind)) = sources
        .iter()
        .enumerate()
        .find_map(|(i, s)| s.kind.map(|k| (i, k)))
    else {
        return RetentionPolicy::Permanent;
    };

    match kind {
        RetentionKind::Permanent => RetentionPolicy::Permanent,
        RetentionKind::DownloadOnce => RetentionPolicy::DownloadOnce,
        RetentionKind::Ttl => sources[index..]
            .iter()
            .find_map(|s| s.ttl_secs)
            .map(|ttl_secs| RetentionPolicy::Ttl { ttl_secs })
            .unwrap_or(RetentionPolicy::Permanent),
    }
}
