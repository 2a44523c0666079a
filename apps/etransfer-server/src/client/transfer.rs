//! Resumable transfers
//!
//! Uploads speak tus against the selected endpoint: create, then PATCH
//! chunks carrying a SHA-256 `Upload-Checksum`. The server's offset is the
//! only source of truth; after any doubt (409, dropped connection) the
//! client asks for it again instead of guessing. A quota rejection (507) is
//! waited out by polling storage status, then the same chunk is retried at
//! the unchanged offset.
//!
//! A fresh download of a complete file is one streamed GET. Range GETs are
//! only used to resume from whatever is already on disk, or to follow a
//! file that is still being uploaded.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::selector::{EndpointSelector, HttpProber};
use super::ClientError;
use crate::quota::StorageStatus;
use crate::retention::RetentionRequest;
use crate::routes::files::FileInfo;
use crate::routes::info::{EndpointList, ServerInfo};
use crate::routes::profile::API_TOKEN_HEADER;
use crate::routes::tus::OFFSET_OCTET_STREAM;
use crate::traffic::{EndpointInfo, TransferDirection};
use crate::upload::{
    encode_metadata, ChecksumAlgorithm, ChunkChecksum, SessionState, DEFAULT_CHUNK_SIZE,
    TUS_VERSION,
};

type Result<T> = std::result::Result<T, ClientError>;

/// Client behaviour knobs
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub chunk_size: usize,
    /// Sent as `X-API-Token`
    pub api_token: Option<String>,
    /// Storage status poll interval while waiting out a quota rejection
    pub quota_poll_interval: Duration,
    /// Give up waiting for space after this long
    pub quota_wait_limit: Duration,
    /// Pause before retrying a chunk that failed transiently
    pub retry_backoff: Duration,
    /// Consecutive transient failures tolerated per chunk
    pub max_retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            api_token: None,
            quota_poll_interval: Duration::from_secs(5),
            quota_wait_limit: Duration::from_secs(10 * 60),
            retry_backoff: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub id: String,
    pub upload_url: String,
    pub endpoint: String,
    /// Bytes committed on the server
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub id: String,
    pub path: PathBuf,
    pub endpoint: String,
    /// Bytes on disk
    pub size: u64,
    /// The remote file is complete and fully present on disk
    pub complete: bool,
    /// Fetched in one request covering the whole file
    pub full_download: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: Option<String>,
}

// ============================================================================
// Transfer Client
// ============================================================================

#[derive(Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    server_url: String,
    options: ClientOptions,
    selector: EndpointSelector,
}

impl TransferClient {
    pub fn new(server_url: &str, options: ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let selector = EndpointSelector::new(Arc::new(HttpProber::new(http.clone())));

        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            options,
            selector,
        })
    }

    pub fn with_selector(mut self, selector: EndpointSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    // ========================================================================
    // Server information
    // ========================================================================

    pub async fn info(&self) -> Result<ServerInfo> {
        self.get_json(&self.server_url, "/api/info").await
    }

    pub async fn storage_status(&self) -> Result<StorageStatus> {
        self.get_json(&self.server_url, "/api/storage").await
    }

    pub async fn endpoints(&self) -> Result<Vec<EndpointInfo>> {
        let list: EndpointList = self.get_json(&self.server_url, "/api/endpoints").await?;
        Ok(list.endpoints)
    }

    /// Best reachable endpoint for `direction`, or the configured server
    /// URL when none is
    pub async fn select_endpoint(&self, direction: TransferDirection) -> String {
        let endpoints = match self.endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(error = %e, "Endpoint listing failed, using server URL");
                return self.server_url.clone();
            }
        };

        match self.selector.select(endpoints, direction).await {
            Some(candidate) => candidate.endpoint.url.trim_end_matches('/').to_string(),
            None => self.server_url.clone(),
        }
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Upload a file from scratch
    pub async fn upload_file(&self, path: &Path, retention: RetentionRequest) -> Result<UploadReport> {
        let base = self.select_endpoint(TransferDirection::Upload).await;
        let size = tokio::fs::metadata(path).await?.len();

        let mut metadata = BTreeMap::new();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            metadata.insert("filename".to_string(), name.to_string());
            metadata.insert(
                "filetype".to_string(),
                mime_guess::from_path(path).first_or_octet_stream().to_string(),
            );
        }

        let upload_url = self.create_upload(&base, size, &metadata, &retention).await?;
        tracing::info!(url = %upload_url, size = size, "Upload created");

        let committed = self.send_chunks(&base, &upload_url, path, size, 0).await?;
        Ok(UploadReport {
            id: last_segment(&upload_url),
            upload_url,
            endpoint: base,
            size: committed,
        })
    }

    /// Continue an upload created earlier, from the server's offset
    pub async fn resume_upload(&self, upload_url: &str, path: &Path) -> Result<UploadReport> {
        let base = origin_of(upload_url)?;
        let size = tokio::fs::metadata(path).await?.len();

        let (offset, length) = self.query_offset(upload_url).await?;
        if let Some(length) = length.filter(|l| *l != size) {
            return Err(ClientError::Protocol(format!(
                "upload expects {} bytes but the file has {}",
                length, size
            )));
        }
        tracing::info!(url = %upload_url, offset = offset, size = size, "Resuming upload");

        let committed = self.send_chunks(&base, upload_url, path, size, offset).await?;
        Ok(UploadReport {
            id: last_segment(upload_url),
            upload_url: upload_url.to_string(),
            endpoint: base,
            size: committed,
        })
    }

    async fn create_upload(
        &self,
        base: &str,
        size: u64,
        metadata: &BTreeMap<String, String>,
        retention: &RetentionRequest,
    ) -> Result<String> {
        let mut waited = Duration::ZERO;

        loop {
            let mut request = self
                .tus(Method::POST, &format!("{}/tus", base))
                .header("upload-length", size)
                .header("upload-metadata", encode_metadata(metadata));
            if let Some(kind) = retention.kind {
                request = request.header("x-retention-policy", kind.as_str());
            }
            if let Some(ttl) = retention.ttl_secs {
                request = request.header("x-retention-ttl", ttl);
            }

            let response = request.send().await?;
            match response.status().as_u16() {
                201 => {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| ClientError::Protocol("creation without Location".into()))?;
                    return resolve_location(base, location);
                }
                507 => self.wait_for_space(base, size, &mut waited).await?,
                _ => return Err(rejection(response).await),
            }
        }
    }

    /// PATCH chunks from `offset` until the server holds `size` bytes
    async fn send_chunks(
        &self,
        base: &str,
        upload_url: &str,
        path: &Path,
        size: u64,
        mut offset: u64,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let chunk_size = self.options.chunk_size.max(1) as u64;
        let mut failures = 0;
        let mut waited = Duration::ZERO;

        while offset < size {
            let len = chunk_size.min(size - offset) as usize;
            let mut chunk = vec![0u8; len];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut chunk).await?;
            let checksum = ChunkChecksum::compute(ChecksumAlgorithm::Sha256, &chunk);

            let sent = self
                .tus(Method::PATCH, upload_url)
                .header(header::CONTENT_TYPE, OFFSET_OCTET_STREAM)
                .header("upload-offset", offset)
                .header("upload-checksum", checksum.to_header())
                .body(chunk)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    // The chunk may or may not have landed; a 409 on the
                    // next attempt brings the offset back in line
                    failures = self.count_failure(failures, e.to_string())?;
                    tracing::warn!(offset = offset, error = %e, "Chunk send failed, retrying");
                    tokio::time::sleep(self.options.retry_backoff).await;
                    continue;
                }
            };

            match response.status().as_u16() {
                200 | 204 => {
                    offset = header_u64(&response, "upload-offset")
                        .ok_or_else(|| ClientError::Protocol("PATCH without Upload-Offset".into()))?;
                    failures = 0;
                    tracing::debug!(offset = offset, size = size, "Chunk committed");
                }
                507 => self.wait_for_space(base, len as u64, &mut waited).await?,
                409 => {
                    let (server_offset, _) = self.query_offset(upload_url).await?;
                    tracing::info!(local = offset, server = server_offset, "Offset resynchronised");
                    offset = server_offset;
                }
                423 => {
                    failures = self.count_failure(failures, "upload locked".to_string())?;
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                460 => {
                    failures = self.count_failure(failures, "checksum mismatch".to_string())?;
                    tracing::warn!(offset = offset, "Chunk corrupted in transit, resending");
                }
                _ => return Err(rejection(response).await),
            }
        }

        Ok(offset)
    }

    /// Offset and declared length of an upload (HEAD)
    async fn query_offset(&self, upload_url: &str) -> Result<(u64, Option<u64>)> {
        let response = self.tus(Method::HEAD, upload_url).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let offset = header_u64(&response, "upload-offset")
            .ok_or_else(|| ClientError::Protocol("HEAD without Upload-Offset".into()))?;
        Ok((offset, header_u64(&response, "upload-length")))
    }

    /// Poll storage status on `base` until `needed` bytes fit
    async fn wait_for_space(&self, base: &str, needed: u64, waited: &mut Duration) -> Result<()> {
        tracing::info!(needed = needed, "Storage full, waiting for space");

        loop {
            if *waited >= self.options.quota_wait_limit {
                return Err(ClientError::QuotaTimeout {
                    waited_secs: waited.as_secs(),
                });
            }
            tokio::time::sleep(self.options.quota_poll_interval).await;
            *waited += self.options.quota_poll_interval;

            let status: StorageStatus = self.get_json(base, "/api/storage").await?;
            if status.available.map_or(true, |available| available >= needed) {
                tracing::info!(available = ?status.available, "Storage space available again");
                return Ok(());
            }
        }
    }

    fn count_failure(&self, failures: u32, last: String) -> Result<u32> {
        let failures = failures + 1;
        if failures > self.options.max_retries {
            return Err(ClientError::RetriesExhausted {
                attempts: failures,
                last,
            });
        }
        Ok(failures)
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Download a file to `dest`, resuming from bytes already there
    ///
    /// A complete file with nothing on disk yet is streamed with a single
    /// plain GET, which counts as a full download on the server.
    pub async fn download_file(&self, id: &str, dest: &Path) -> Result<DownloadReport> {
        let base = self.select_endpoint(TransferDirection::Download).await;
        let info: FileInfo = self.get_json(&base, &format!("/api/files/{}", id)).await?;
        let complete = info.state == SessionState::Completed;
        let target = if complete { info.size } else { info.uploaded_size };

        let mut existing = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if existing > target {
            tracing::warn!(path = %dest.display(), existing = existing, target = target, "Local file larger than remote, restarting");
            existing = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(dest)
            .await?;
        file.set_len(existing).await?;
        file.seek(SeekFrom::Start(existing)).await?;

        let url = format!("{}/api/files/{}/download", base, id);
        let chunk_size = self.options.chunk_size.max(1) as u64;
        let mut pos = existing;
        let full_download = existing == 0 && complete;

        if full_download {
            let response = self.request(Method::GET, &url).send().await?;
            if !response.status().is_success() {
                return Err(rejection(response).await);
            }
            pos += write_body(&mut file, response).await?;
        } else {
            while pos < target {
                let end = (pos + chunk_size).min(target);
                let response = self
                    .request(Method::GET, &url)
                    .header(header::RANGE, format!("bytes={}-{}", pos, end - 1))
                    .send()
                    .await?;

                match response.status().as_u16() {
                    206 => pos += write_body(&mut file, response).await?,
                    200 => {
                        return Err(ClientError::Protocol(
                            "server ignored the Range header".into(),
                        ))
                    }
                    _ => return Err(rejection(response).await),
                }
                tracing::debug!(id = %id, pos = pos, target = target, "Range received");
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        tracing::info!(id = %id, bytes = pos, complete = complete, "Download finished");
        Ok(DownloadReport {
            id: id.to_string(),
            path: dest.to_path_buf(),
            endpoint: base,
            size: pos,
            complete: complete && pos == target,
            full_download,
        })
    }

    // ========================================================================
    // Request helpers
    // ========================================================================

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.options.api_token {
            Some(token) => request.header(API_TOKEN_HEADER, token),
            None => request,
        }
    }

    fn tus(&self, method: Method, url: &str) -> RequestBuilder {
        self.request(method, url).header("tus-resumable", TUS_VERSION)
    }

    async fn get_json<T: DeserializeOwned>(&self, base: &str, path: &str) -> Result<T> {
        let response = self
            .request(Method::GET, &format!("{}{}", base, path))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }
}

/// Turn an error response into `ClientError::Status`
async fn rejection(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Status {
            status,
            code: body.code,
            message: body.error,
        },
        Err(_) => ClientError::Status {
            status,
            code: None,
            message: text,
        },
    }
}

async fn write_body(file: &mut tokio::fs::File, mut response: Response) -> Result<u64> {
    let mut written = 0;
    while let Some(bytes) = response.chunk().await? {
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;
    }
    Ok(written)
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn resolve_location(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base).map_err(|e| ClientError::Protocol(format!("bad endpoint URL: {}", e)))?;
    base.join(location)
        .map(|url| url.to_string())
        .map_err(|e| ClientError::Protocol(format!("bad Location {}: {}", location, e)))
}

fn origin_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| ClientError::Protocol(format!("bad upload URL: {}", e)))?;
    Ok(parsed.origin().ascii_serialization())
}

fn last_segment(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CredentialProfile};
    use crate::retention::RetentionKind;
    use crate::routes::testing::{state, state_with};
    use crate::state::AppState;
    use crate::upload::CreateUpload;
    use tempfile::TempDir;

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::routes::router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: &str) -> TransferClient {
        TransferClient::new(
            url,
            ClientOptions {
                chunk_size: 4,
                quota_poll_interval: Duration::from_millis(50),
                quota_wait_limit: Duration::from_secs(5),
                retry_backoff: Duration::from_millis(10),
                ..ClientOptions::default()
            },
        )
        .unwrap()
    }

    async fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let state = state();
        let url = serve(state.clone()).await;
        let client = client(&url);
        let dir = TempDir::new().unwrap();
        let source = write_file(&dir, "fox.txt", b"the quick brown fox").await;

        let report = client.upload_file(&source, RetentionRequest::default()).await.unwrap();
        assert_eq!(report.size, 19);
        assert_eq!(report.endpoint, url);

        let session = state.engine().get_session(&report.id).await.unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.filename(), Some("fox.txt"));
        assert_eq!(session.filetype(), Some("text/plain"));

        let dest = dir.path().join("copy.txt");
        let download = client.download_file(&report.id, &dest).await.unwrap();
        assert!(download.complete);
        assert!(download.full_download);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"the quick brown fox");
    }

    #[tokio::test]
    async fn test_fresh_download_consumes_download_once_file() {
        let state = state();
        let url = serve(state.clone()).await;
        let dir = TempDir::new().unwrap();
        let client = client(&url);

        // Three chunks' worth
        let source = write_file(&dir, "once.bin", b"0123456789ab").await;
        let retention = RetentionRequest::new(Some(RetentionKind::DownloadOnce), None);
        let report = client.upload_file(&source, retention).await.unwrap();

        let dest = dir.path().join("once.out");
        let download = client.download_file(&report.id, &dest).await.unwrap();
        assert!(download.full_download);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123456789ab");

        // Reclaim runs after the response; the tombstone answers 410
        let info_url = format!("{}/api/files/{}", url, report.id);
        let mut status = 0;
        for _ in 0..50 {
            status = reqwest::get(&info_url).await.unwrap().status().as_u16();
            if status == 410 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, 410);
    }

    #[tokio::test]
    async fn test_resume_upload_from_server_offset() {
        let state = state();
        let url = serve(state.clone()).await;
        let dir = TempDir::new().unwrap();
        let data = b"0123456789ab";
        let source = write_file(&dir, "digits.bin", data).await;

        let session = state
            .engine()
            .create(
                CreateUpload {
                    declared_length: Some(12),
                    ..CreateUpload::default()
                },
                &CredentialProfile::anonymous(),
            )
            .await
            .unwrap();
        state.engine().append(&session.id, 0, &data[..5], None).await.unwrap();

        let upload_url = format!("{}/tus/{}", url, session.id);
        let report = client(&url).resume_upload(&upload_url, &source).await.unwrap();

        assert_eq!(report.size, 12);
        assert_eq!(report.id, session.id);
        let stored = state.engine().blobs().read_at(&session.id, 0, 12).await.unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn test_waits_out_quota_rejection() {
        let mut config = Config::default();
        config.runtime.max_storage_size = Some(10);
        let state = state_with(config);
        let url = serve(state.clone()).await;
        let dir = TempDir::new().unwrap();
        let source = write_file(&dir, "eight.bin", b"12345678").await;

        let blocker = state
            .engine()
            .create(
                CreateUpload {
                    declared_length: Some(6),
                    ..CreateUpload::default()
                },
                &CredentialProfile::anonymous(),
            )
            .await
            .unwrap();

        let engine = state.engine().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            engine.terminate(&blocker.id).await.unwrap();
        });

        let report = client(&url)
            .upload_file(&source, RetentionRequest::default())
            .await
            .unwrap();
        assert_eq!(report.size, 8);
        assert_eq!(state.quota().used().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_download_resumes_partial_file() {
        let state = state();
        let url = serve(state.clone()).await;
        let dir = TempDir::new().unwrap();
        let source = write_file(&dir, "abc.txt", b"abcdefghij").await;
        let client = client(&url);

        let report = client.upload_file(&source, RetentionRequest::default()).await.unwrap();

        let dest = write_file(&dir, "partial.txt", b"abcdef").await;
        let download = client.download_file(&report.id, &dest).await.unwrap();

        assert_eq!(download.size, 10);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn test_small_file_is_one_full_download() {
        let state = state();
        let url = serve(state.clone()).await;
        let dir = TempDir::new().unwrap();
        let source = write_file(&dir, "tiny.txt", b"hi").await;
        let client = client(&url);

        let report = client.upload_file(&source, RetentionRequest::default()).await.unwrap();
        let download = client
            .download_file(&report.id, &dir.path().join("tiny.out"))
            .await
            .unwrap();
        assert!(download.full_download);
    }

    #[tokio::test]
    async fn test_rejections_carry_status() {
        let url = serve(state()).await;
        let dir = TempDir::new().unwrap();

        let err = client(&url)
            .download_file("nosuchfile", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(matches!(err, ClientError::Status { code: Some(ref c), .. } if c == "NOT_FOUND"));
    }

    #[test]
    fn test_location_resolution() {
        assert_eq!(
            resolve_location("http://10.0.0.1:8765", "/tus/abc").unwrap(),
            "http://10.0.0.1:8765/tus/abc"
        );
        assert_eq!(
            resolve_location("http://10.0.0.1:8765", "https://cdn.example.org/tus/abc").unwrap(),
            "https://cdn.example.org/tus/abc"
        );
        assert_eq!(origin_of("http://10.0.0.1:8765/tus/abc").unwrap(), "http://10.0.0.1:8765");
        assert_eq!(last_segment("http://h/tus/abc"), "abc");
    }
}
