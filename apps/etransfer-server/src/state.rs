//! Application state management

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{open_backend, BackendError, StateBackend};
use crate::config::{AdvertisedEndpoint, Config, Settings};
use crate::quota::QuotaController;
use crate::range::RangeReader;
use crate::reload::ConfigReloader;
use crate::retention::RetentionSweeper;
use crate::storage::BlobStore;
use crate::traffic::{detected_endpoint, EndpointPublisher, TrafficMonitor};
use crate::upload::{EngineOptions, UploadEngine};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to open state backend: {0}")]
    Backend(#[from] BackendError),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    settings: Settings,
    engine: UploadEngine,
    reader: RangeReader,
    sweeper: RetentionSweeper,
    monitor: TrafficMonitor,
    publisher: EndpointPublisher,
    reloader: ConfigReloader,
}

impl AppState {
    /// Open the configured backend and storage and wire the services
    pub async fn new(config: Config) -> Result<Self, StateError> {
        let backend = open_backend(
            config.storage.backend,
            &config.storage.path,
            &config.storage.database_url,
        )
        .await?;
        let blobs = BlobStore::with_local_storage(&config.storage.path);
        let monitor = TrafficMonitor::with_interval(
            config.traffic.interfaces.clone(),
            Duration::from_secs(config.traffic.sample_secs.max(1)),
        );

        let detected = detected_endpoint(config.server.port);
        let state = Self::with_parts(config, backend, blobs, monitor, detected);

        // Backends without a persistent ledger start from zero
        let ledger = state.quota().reconcile().await?;
        tracing::info!(
            used = ledger.actual,
            files = ledger.files_count,
            uploads = ledger.uploads_count,
            "Quota ledger loaded"
        );

        Ok(state)
    }

    /// Assemble from already-opened parts; `detected` is published when no
    /// endpoint is configured
    pub fn with_parts(
        config: Config,
        backend: Arc<dyn StateBackend>,
        blobs: BlobStore,
        monitor: TrafficMonitor,
        detected: Option<AdvertisedEndpoint>,
    ) -> Self {
        let settings = Settings::new(config.runtime.clone());
        let quota = QuotaController::new(backend.clone(), settings.clone());

        let options = EngineOptions {
            max_upload_size: config.storage.max_upload_size,
            upload_expiration: chrono::Duration::seconds(
                config.lifecycle.upload_expiration_secs as i64,
            ),
            lock_ttl: Duration::from_secs(config.lifecycle.lock_ttl_secs),
        };
        let engine = UploadEngine::new(backend, blobs, quota, settings.clone(), options);

        let sweeper = RetentionSweeper::new(
            engine.clone(),
            chrono::Duration::seconds(config.lifecycle.tombstone_ttl_secs as i64),
        );
        let publisher = EndpointPublisher::with_detected(settings.clone(), monitor.clone(), detected);
        let reloader = ConfigReloader::new(settings.clone(), config.reload.clone());

        Self {
            inner: Arc::new(AppStateInner {
                reader: RangeReader::new(engine.clone()),
                config,
                settings,
                engine,
                sweeper,
                monitor,
                publisher,
                reloader,
            }),
        }
    }

    /// Get the static configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the hot-reloadable settings
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.inner.engine
    }

    pub fn quota(&self) -> &QuotaController {
        self.inner.engine.quota()
    }

    pub fn reader(&self) -> &RangeReader {
        &self.inner.reader
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        &self.inner.sweeper
    }

    pub fn monitor(&self) -> &TrafficMonitor {
        &self.inner.monitor
    }

    pub fn publisher(&self) -> &EndpointPublisher {
        &self.inner.publisher
    }

    pub fn reloader(&self) -> &ConfigReloader {
        &self.inner.reloader
    }
}
