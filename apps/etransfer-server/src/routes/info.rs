//! Server information routes

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use super::profile::Profile;
use super::Result;
use crate::quota::StorageStatus;
use crate::state::AppState;
use crate::traffic::{best_for, EndpointInfo, TrafficSample, TransferDirection};
use crate::upload::{ChecksumAlgorithm, TUS_EXTENSIONS, TUS_VERSION};

/// Create the info router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/info", get(server_info))
        .route("/health", get(health_check))
        .route("/storage", get(storage_status))
        .route("/endpoints", get(endpoints))
        .route("/traffic", get(traffic))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Capabilities advertised to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub tus_version: String,
    pub tus_extensions: Vec<String>,
    pub checksum_algorithms: Vec<String>,
    /// Per-file maximum for the caller
    pub max_upload_size: Option<u64>,
    pub max_storage_size: Option<u64>,
    pub chunk_size: usize,
    pub state_backend: String,
    pub shared_backend: bool,
    pub retention_policies: Vec<String>,
    pub default_retention: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointList {
    pub endpoints: Vec<EndpointInfo>,
    /// URL of the reachable endpoint with the least inbound load
    #[serde(default)]
    pub best_for_upload: Option<String>,
    /// URL of the reachable endpoint with the least outbound load
    #[serde(default)]
    pub best_for_download: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrafficReport {
    pub interfaces: Vec<TrafficSample>,
}

/// GET /api/health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/info
async fn server_info(State(state): State<AppState>, Profile(profile): Profile) -> Json<ServerInfo> {
    let settings = state.settings().snapshot();
    let backend = state.engine().backend();
    let default_retention = crate::retention::resolve(
        &profile.retention_request(),
        &settings.default_retention,
        &Default::default(),
    );

    Json(ServerInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tus_version: TUS_VERSION.to_string(),
        tus_extensions: TUS_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        checksum_algorithms: ChecksumAlgorithm::ALL
            .iter()
            .map(|a| a.as_str().to_string())
            .collect(),
        max_upload_size: state.engine().max_upload_size(&profile),
        max_storage_size: settings.max_storage_size,
        chunk_size: settings.chunk_size,
        state_backend: backend.name().to_string(),
        shared_backend: backend.is_shared(),
        retention_policies: ["permanent", "download_once", "ttl"]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        default_retention: default_retention.to_string(),
        public_url: state.config().server.public_url.clone(),
    })
}

/// GET /api/storage
async fn storage_status(State(state): State<AppState>) -> Result<Json<StorageStatus>> {
    Ok(Json(state.quota().status().await?))
}

/// GET /api/endpoints
async fn endpoints(State(state): State<AppState>) -> Json<EndpointList> {
    let endpoints = state.publisher().endpoints();
    let best = |direction| best_for(&endpoints, direction).map(|e| e.url.clone());

    Json(EndpointList {
        best_for_upload: best(TransferDirection::Upload),
        best_for_download: best(TransferDirection::Download),
        endpoints,
    })
}

/// GET /api/traffic
async fn traffic(State(state): State<AppState>) -> Json<TrafficReport> {
    Json(TrafficReport {
        interfaces: state.monitor().samples(),
    })
}
