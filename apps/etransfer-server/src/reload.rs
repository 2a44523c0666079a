//! Runtime settings reload
//!
//! One reloader backs both `POST /api/admin/reload-config` and the config
//! file watch. The watch polls the file's modification time and size and
//! reloads when either moves. A file that fails to parse leaves the current
//! settings in place and is reported through the status.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{ConfigError, ReloadConfig, RuntimeSettings, Settings};

/// Result of applying a reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub changed: Vec<&'static str>,
    pub max_storage_size: Option<u64>,
    pub chunk_size: usize,
}

/// Where settings come from and how the last reload went
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub config_file: Option<String>,
    pub config_watch: bool,
    /// Seconds between file checks
    pub config_watch_interval: u64,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

#[derive(Default)]
struct WatchState {
    seen: Option<FileStamp>,
    last_reload_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Clone)]
pub struct ConfigReloader {
    inner: Arc<ReloaderInner>,
}

struct ReloaderInner {
    settings: Settings,
    source: ReloadConfig,
    state: Mutex<WatchState>,
}

impl ConfigReloader {
    /// The file as it is now counts as already loaded
    pub fn new(settings: Settings, source: ReloadConfig) -> Self {
        let seen = source.file.as_deref().and_then(stamp);
        Self {
            inner: Arc::new(ReloaderInner {
                settings,
                source,
                state: Mutex::new(WatchState {
                    seen,
                    ..WatchState::default()
                }),
            }),
        }
    }

    /// Re-read the settings and swap them in
    pub fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        match RuntimeSettings::reload(self.inner.source.file.as_deref()) {
            Ok(next) => Ok(self.apply(next)),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected configuration reload");
                self.inner.state.lock().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn apply(&self, next: RuntimeSettings) -> ReloadOutcome {
        let max_storage_size = next.max_storage_size;
        let chunk_size = next.chunk_size;
        let changed = self.inner.settings.replace(next);

        {
            let mut state = self.inner.state.lock();
            state.last_reload_at = Some(Utc::now());
            state.last_error = None;
        }

        if changed.is_empty() {
            tracing::info!("Configuration reloaded, nothing changed");
        } else {
            tracing::info!(changed = ?changed, "Configuration reloaded");
        }

        ReloadOutcome {
            changed,
            max_storage_size,
            chunk_size,
        }
    }

    pub fn status(&self) -> ConfigStatus {
        let state = self.inner.state.lock();
        ConfigStatus {
            config_file: self
                .inner
                .source
                .file
                .as_ref()
                .map(|p| p.display().to_string()),
            config_watch: self.watching(),
            config_watch_interval: self.inner.source.watch_interval_secs,
            last_reload_at: state.last_reload_at,
            last_error: state.last_error.clone(),
        }
    }

    fn watching(&self) -> bool {
        self.inner.source.watch && self.inner.source.file.is_some()
    }

    /// Reload if the config file moved since it was last seen; returns
    /// whether a reload was attempted
    pub fn poll(&self) -> bool {
        let Some(path) = self.inner.source.file.as_deref() else {
            return false;
        };

        let current = stamp(path);
        {
            let mut state = self.inner.state.lock();
            if state.seen == current {
                return false;
            }
            state.seen = current.clone();
        }

        if current.is_none() {
            tracing::warn!(path = %path.display(), "Config file disappeared, keeping current settings");
            return false;
        }

        tracing::info!(path = %path.display(), "Config file changed");
        let _ = self.reload();
        true
    }

    /// Watch the config file; `None` when watching is off or there is no file
    pub fn start_watch(self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.watching() {
            return None;
        }

        let interval = Duration::from_secs(self.inner.source.watch_interval_secs.max(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately and the file was just read
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.poll();
            }
        }))
    }
}
