//! Range reads of possibly-incomplete files
//!
//! Bytes below a session's committed offset never change, so a delivery
//! takes one snapshot of the record and streams from the blob without
//! further coordination. The delivery holds a read guard for its whole
//! lifetime, which keeps deletions away until the last byte is sent.

use std::io;

use axum::body::Bytes;
use chrono::Utc;
use futures::Stream;

use crate::retention::{ReadGuard, RetentionPolicy};
use crate::upload::{Reclaim, SessionState, UploadEngine, UploadError, UploadSession};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `Content-Range` value for a non-empty range
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end.saturating_sub(1), total)
    }
}

/// A parsed single-range `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b` (inclusive)
    Bounded { first: u64, last: u64 },
    /// `bytes=a-`
    From { first: u64 },
    /// `bytes=-n`
    Suffix { len: u64 },
}

impl RangeSpec {
    pub fn parse(header: &str) -> Result<Self, UploadError> {
        let bad = || UploadError::BadRequest(format!("invalid Range header: {}", header));

        let spec = header.trim().strip_prefix("bytes=").ok_or_else(bad)?;
        if spec.contains(',') {
            return Err(UploadError::BadRequest(
                "multiple ranges are not supported".to_string(),
            ));
        }

        let (first, last) = spec.split_once('-').ok_or_else(bad)?;
        let (first, last) = (first.trim(), last.trim());

        match (first.is_empty(), last.is_empty()) {
            (false, false) => {
                let first: u64 = first.parse().map_err(|_| bad())?;
                let last: u64 = last.parse().map_err(|_| bad())?;
                if last < first {
                    return Err(bad());
                }
                Ok(Self::Bounded { first, last })
            }
            (false, true) => Ok(Self::From {
                first: first.parse().map_err(|_| bad())?,
            }),
            (true, false) => Ok(Self::Suffix {
                len: last.parse().map_err(|_| bad())?,
            }),
            (true, true) => Err(bad()),
        }
    }

    /// Resolve against a session snapshot
    pub fn resolve(&self, session: &UploadSession) -> Result<ByteRange, UploadError> {
        let available = session.uploaded_offset;
        let complete = session.state == SessionState::Completed;
        let unsatisfiable = |size| UploadError::RangeNotSatisfiable { size };
        let unavailable = |requested| UploadError::RangeUnavailable {
            requested,
            available,
        };

        if complete {
            let size = available;
            return match *self {
                Self::Bounded { first, .. } | Self::From { first } if first >= size => {
                    Err(unsatisfiable(size))
                }
                Self::Bounded { first, last } => Ok(ByteRange::new(first, (last + 1).min(size))),
                Self::From { first } => Ok(ByteRange::new(first, size)),
                Self::Suffix { len } if len == 0 || size == 0 => Err(unsatisfiable(size)),
                Self::Suffix { len } => Ok(ByteRange::new(size - len.min(size), size)),
            };
        }

        // Incomplete: only committed bytes are servable
        match *self {
            Self::Bounded { first, .. } | Self::From { first }
                if session.total_size.is_some_and(|total| first >= total) =>
            {
                Err(unsatisfiable(session.total_size.unwrap_or(available)))
            }
            Self::Bounded { first, last } => {
                let end = session.total_size.map_or(last + 1, |total| (last + 1).min(total));
                if end > available {
                    Err(unavailable(end))
                } else {
                    Ok(ByteRange::new(first, end))
                }
            }
            Self::From { first } if first >= available => Err(unavailable(first + 1)),
            Self::From { first } => Ok(ByteRange::new(first, available)),
            // The tail of an unfinished file does not exist yet
            Self::Suffix { .. } => Err(unavailable(session.known_length().max(available + 1))),
        }
    }
}

// ============================================================================
// Range Reader
// ============================================================================

/// Opens deliveries
#[derive(Clone)]
pub struct RangeReader {
    engine: UploadEngine,
}

impl RangeReader {
    pub fn new(engine: UploadEngine) -> Self {
        Self { engine }
    }

    /// Start a delivery of `range` (the whole committed file when `None`)
    pub async fn open(&self, id: &str, range: Option<RangeSpec>) -> Result<Delivery, UploadError> {
        let guard = self
            .engine
            .guards()
            .acquire_read(id)
            .ok_or_else(|| UploadError::Gone {
                id: id.to_string(),
                state: SessionState::Deleted,
            })?;

        let session = self.engine.get_session(id).await?;
        let byte_range = match range {
            Some(spec) => spec.resolve(&session)?,
            None => ByteRange::new(0, session.uploaded_offset),
        };

        let full_download = session.state == SessionState::Completed
            && byte_range == ByteRange::new(0, session.known_length());

        tracing::debug!(
            session_id = %id,
            start = byte_range.start,
            end = byte_range.end,
            full = full_download,
            "Opened delivery"
        );

        Ok(Delivery {
            engine: self.engine.clone(),
            session,
            range: byte_range,
            partial: range.is_some(),
            full_download,
            _guard: guard,
        })
    }
}

/// One in-progress delivery
pub struct Delivery {
    engine: UploadEngine,
    pub session: UploadSession,
    pub range: ByteRange,
    /// A `Range` header was given
    pub partial: bool,
    /// The delivery covers the complete file end-to-end
    pub full_download: bool,
    _guard: ReadGuard,
}

impl Delivery {
    /// Best-known length of the file
    pub fn total_length(&self) -> u64 {
        self.session.known_length()
    }

    /// Stream the range in `chunk_size` pieces; finishing the stream
    /// records a full download
    pub fn into_stream(
        self,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let chunk_size = chunk_size.max(1);
        let start = self.range.start;

        futures::stream::unfold((Some(self), start), move |(delivery, pos)| async move {
            let delivery = delivery?;

            if pos >= delivery.range.end {
                tokio::spawn(async move {
                    if let Err(e) = delivery.finish().await {
                        tracing::warn!(error = %e, "Failed to record delivery");
                    }
                });
                return None;
            }

            let len = ((delivery.range.end - pos) as usize).min(chunk_size);
            match delivery
                .engine
                .blobs()
                .read_at(&delivery.session.id, pos, len)
                .await
            {
                Ok(bytes) => Some((Ok(Bytes::from(bytes)), (Some(delivery), pos + len as u64))),
                Err(e) => {
                    tracing::error!(session_id = %delivery.session.id, offset = pos, error = %e, "Delivery read failed");
                    Some((Err(io::Error::new(io::ErrorKind::Other, e)), (None, pos)))
                }
            }
        })
    }

    /// Read the whole range into memory and finish
    pub async fn read_all(self) -> Result<Vec<u8>, UploadError> {
        let data = self
            .engine
            .blobs()
            .read_at(&self.session.id, self.range.start, self.range.len() as usize)
            .await?;
        self.finish().await?;
        Ok(data)
    }

    /// Release the guard and, for a full download, record it and apply
    /// download-once retention
    pub async fn finish(self) -> Result<Option<UploadSession>, UploadError> {
        let Delivery {
            engine,
            session,
            full_download,
            _guard,
            ..
        } = self;
        drop(_guard);

        if !full_download {
            return Ok(None);
        }

        let updated = engine.record_full_download(&session.id, Utc::now()).await?;

        if updated.retention == RetentionPolicy::DownloadOnce {
            let outcome = engine
                .reclaim(&session.id, SessionState::Deleted, |s| {
                    s.retention == RetentionPolicy::DownloadOnce && s.file.download_count > 0
                })
                .await?;

            match outcome {
                Reclaim::Destroyed => {
                    tracing::info!(session_id = %session.id, "Download-once file deleted")
                }
                Reclaim::Busy => {
                    tracing::debug!(session_id = %session.id, "Download-once file busy, left to sweep")
                }
                Reclaim::Skipped => {}
            }
        }

        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialProfile;
    use crate::retention::{RetentionKind, RetentionRequest};
    use crate::upload::engine::tests::{create, engine};
    use crate::upload::CreateUpload;
    use futures::StreamExt;

    #[test]
    fn test_parse() {
        assert_eq!(
            RangeSpec::parse("bytes=0-499").unwrap(),
            RangeSpec::Bounded { first: 0, last: 499 }
        );
        assert_eq!(RangeSpec::parse("bytes=10-").unwrap(), RangeSpec::From { first: 10 });
        assert_eq!(RangeSpec::parse("bytes=-5").unwrap(), RangeSpec::Suffix { len: 5 });

        assert!(RangeSpec::parse("bytes=5-1").is_err());
        assert!(RangeSpec::parse("bytes=0-1,4-5").is_err());
        assert!(RangeSpec::parse("items=0-1").is_err());
        assert!(RangeSpec::parse("bytes=-").is_err());
    }

    fn snapshot(offset: u64, total: Option<u64>, state: SessionState) -> UploadSession {
        let mut s = crate::backend::conformance::record(total);
        s.uploaded_offset = offset;
        s.state = state;
        s
    }

    #[test]
    fn test_partial_file_ranges() {
        let s = snapshot(500, Some(1000), SessionState::Uploading);

        let err = RangeSpec::Bounded { first: 600, last: 699 }.resolve(&s).unwrap_err();
        assert!(matches!(err, UploadError::RangeUnavailable { requested: 700, available: 500 }));

        let ok = RangeSpec::Bounded { first: 0, last: 499 }.resolve(&s).unwrap();
        assert_eq!(ok.len(), 500);

        // Open-ended ranges clamp to the committed offset
        assert_eq!(
            RangeSpec::From { first: 100 }.resolve(&s).unwrap(),
            ByteRange::new(100, 500)
        );
        assert!(matches!(
            RangeSpec::From { first: 500 }.resolve(&s),
            Err(UploadError::RangeUnavailable { .. })
        ));
        assert!(matches!(
            RangeSpec::From { first: 1000 }.resolve(&s),
            Err(UploadError::RangeNotSatisfiable { size: 1000 })
        ));
        assert!(matches!(
            RangeSpec::Suffix { len: 10 }.resolve(&s),
            Err(UploadError::RangeUnavailable { .. })
        ));
    }

    #[test]
    fn test_completed_file_ranges() {
        let s = snapshot(100, Some(100), SessionState::Completed);

        assert_eq!(
            RangeSpec::Bounded { first: 90, last: 500 }.resolve(&s).unwrap(),
            ByteRange::new(90, 100)
        );
        assert_eq!(
            RangeSpec::Suffix { len: 10 }.resolve(&s).unwrap(),
            ByteRange::new(90, 100)
        );
        assert!(matches!(
            RangeSpec::From { first: 100 }.resolve(&s),
            Err(UploadError::RangeNotSatisfiable { size: 100 })
        ));
        assert_eq!(ByteRange::new(90, 100).content_range(100), "bytes 90-99/100");
    }

    #[tokio::test]
    async fn test_read_partial_upload() {
        let engine = engine();
        let anon = CredentialProfile::anonymous();
        let session = engine.create(create(Some(1000)), &anon).await.unwrap();
        engine.append(&session.id, 0, &[9u8; 500], None).await.unwrap();

        let reader = RangeReader::new(engine.clone());

        let delivery = reader
            .open(&session.id, Some(RangeSpec::Bounded { first: 0, last: 499 }))
            .await
            .unwrap();
        assert_eq!(delivery.total_length(), 1000);
        assert!(!delivery.full_download);
        assert_eq!(delivery.read_all().await.unwrap(), vec![9u8; 500]);

        assert!(matches!(
            reader
                .open(&session.id, Some(RangeSpec::Bounded { first: 600, last: 699 }))
                .await,
            Err(UploadError::RangeUnavailable { .. })
        ));
        assert!(matches!(
            reader.open("missing", None).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_once_gone_after_full_delivery() {
        let engine = engine();
        let anon = CredentialProfile::anonymous();
        let request = CreateUpload {
            declared_length: Some(6),
            retention: RetentionRequest::new(Some(RetentionKind::DownloadOnce), None),
            ..CreateUpload::default()
        };
        let session = engine.create(request, &anon).await.unwrap();
        engine.append(&session.id, 0, b"secret", None).await.unwrap();

        let reader = RangeReader::new(engine.clone());

        // Partial reads covering the whole file do not count
        for (first, last) in [(0, 2), (3, 5)] {
            let d = reader
                .open(&session.id, Some(RangeSpec::Bounded { first, last }))
                .await
                .unwrap();
            d.read_all().await.unwrap();
        }
        assert!(engine.get_session(&session.id).await.is_ok());

        let full = reader.open(&session.id, None).await.unwrap();
        assert!(full.full_download);
        assert_eq!(full.read_all().await.unwrap(), b"secret");

        assert!(matches!(
            engine.get_session(&session.id).await,
            Err(UploadError::Gone { .. })
        ));
        assert!(reader.open(&session.id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_records_download() {
        let engine = engine();
        let anon = CredentialProfile::anonymous();
        let session = engine.create(create(Some(10)), &anon).await.unwrap();
        engine.append(&session.id, 0, b"0123456789", None).await.unwrap();

        let delivery = RangeReader::new(engine.clone())
            .open(&session.id, None)
            .await
            .unwrap();

        let chunks: Vec<_> = delivery.into_stream(4).collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"0123456789");

        // Completion runs on a spawned task
        for _ in 0..50 {
            if engine.get_session(&session.id).await.unwrap().file.download_count == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("download was not recorded");
    }

    #[tokio::test]
    async fn test_open_delivery_blocks_deletion() {
        let engine = engine();
        let anon = CredentialProfile::anonymous();
        let session = engine.create(create(Some(1)), &anon).await.unwrap();
        engine.append(&session.id, 0, b"x", None).await.unwrap();

        let delivery = RangeReader::new(engine.clone())
            .open(&session.id, None)
            .await
            .unwrap();
        assert!(matches!(
            engine.delete_file(&session.id).await,
            Err(UploadError::Locked(_))
        ));

        drop(delivery);
        engine.delete_file(&session.id).await.unwrap();
    }
}
