//! Client-side endpoint selection
//!
//! Endpoints the server reports as unreachable are skipped; the rest are
//! probed concurrently with a bounded timeout. Survivors are ordered by the
//! load in the transfer's direction, then latency, then address, so equal
//! inputs always pick the same endpoint.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::traffic::{EndpointInfo, TransferDirection};

/// Default probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability check of one endpoint
#[async_trait::async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Round-trip latency, or `None` if unreachable
    async fn probe(&self, url: &str) -> Option<Duration>;
}

/// Probes `GET {url}/api/health`
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl EndpointProbe for HttpProber {
    async fn probe(&self, url: &str) -> Option<Duration> {
        let start = Instant::now();
        let health = format!("{}/api/health", url.trim_end_matches('/'));

        match self.client.get(&health).send().await {
            Ok(response) if response.status().is_success() => Some(start.elapsed()),
            Ok(response) => {
                tracing::debug!(url = %url, status = %response.status(), "Endpoint unhealthy");
                None
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Endpoint unreachable");
                None
            }
        }
    }
}

/// A reachable endpoint with its measured latency
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub endpoint: EndpointInfo,
    pub latency: Duration,
}

/// Deterministic preference order: lowest load toward `direction`, lowest
/// latency, smallest address
pub fn compare(a: &Candidate, b: &Candidate, direction: TransferDirection) -> Ordering {
    a.endpoint
        .load_toward(direction)
        .total_cmp(&b.endpoint.load_toward(direction))
        .then_with(|| a.latency.cmp(&b.latency))
        .then_with(|| a.endpoint.address.cmp(&b.endpoint.address))
}

#[derive(Clone)]
pub struct EndpointSelector {
    prober: Arc<dyn EndpointProbe>,
    timeout: Duration,
}

impl EndpointSelector {
    pub fn new(prober: Arc<dyn EndpointProbe>) -> Self {
        Self {
            prober,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe all endpoints at once; unreachable ones are dropped
    pub async fn probe_all(&self, endpoints: Vec<EndpointInfo>) -> Vec<Candidate> {
        let probes = endpoints.into_iter().map(|endpoint| async move {
            let latency = tokio::time::timeout(self.timeout, self.prober.probe(&endpoint.url))
                .await
                .ok()
                .flatten()?;
            Some(Candidate { endpoint, latency })
        });

        join_all(probes).await.into_iter().flatten().collect()
    }

    /// Pick the best reachable endpoint for a transfer in `direction`
    pub async fn select(
        &self,
        endpoints: Vec<EndpointInfo>,
        direction: TransferDirection,
    ) -> Option<Candidate> {
        let total = endpoints.len();
        let (live, down): (Vec<_>, Vec<_>) = endpoints.into_iter().partition(|e| e.reachable);
        if !down.is_empty() {
            tracing::debug!(skipped = down.len(), "Skipping endpoints reported unreachable");
        }

        let candidates = self.probe_all(live).await;
        let chosen = candidates
            .into_iter()
            .min_by(|a, b| compare(a, b, direction));

        match &chosen {
            Some(c) => tracing::info!(
                url = %c.endpoint.url,
                direction = ?direction,
                load = c.endpoint.load_toward(direction),
                latency_ms = c.latency.as_millis() as u64,
                probed = total,
                "Selected endpoint"
            ),
            None => tracing::warn!(probed = total, "No reachable endpoint"),
        }
        chosen
    }
}
