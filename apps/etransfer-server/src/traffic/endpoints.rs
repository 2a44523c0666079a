//! Published endpoint list
//!
//! Combines the advertised addresses (configured, or the auto-detected
//! primary address when none are configured) with current interface load
//! per transfer direction. An endpoint whose interface has no live sample
//! is published as unreachable.

use std::net::{IpAddr, UdpSocket};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{AdvertisedEndpoint, Settings};

use super::TrafficMonitor;

/// Which way the bytes of a transfer flow, seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Client to server; competes with inbound traffic
    Upload,
    /// Server to client; competes with outbound traffic
    Download,
}

/// One endpoint as seen by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub url: String,
    /// `host:port`
    pub address: String,
    pub interface: Option<String>,
    /// Busier direction
    pub load_percent: f64,
    #[serde(default)]
    pub upload_load_percent: f64,
    #[serde(default)]
    pub download_load_percent: f64,
    pub reachable: bool,
}

impl EndpointInfo {
    pub fn load_toward(&self, direction: TransferDirection) -> f64 {
        match direction {
            TransferDirection::Upload => self.upload_load_percent,
            TransferDirection::Download => self.download_load_percent,
        }
    }
}

/// Least loaded reachable endpoint for `direction`, ties broken by address
pub fn best_for(endpoints: &[EndpointInfo], direction: TransferDirection) -> Option<&EndpointInfo> {
    endpoints.iter().filter(|e| e.reachable).min_by(|a, b| {
        a.load_toward(direction)
            .total_cmp(&b.load_toward(direction))
            .then_with(|| a.address.cmp(&b.address))
    })
}

/// Primary outbound address of this host
///
/// Connecting a UDP socket sends nothing; it only selects the route.
pub fn primary_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Endpoint on the primary address, used when none is configured
pub fn detected_endpoint(port: u16) -> Option<AdvertisedEndpoint> {
    let url = match primary_address()? {
        IpAddr::V4(v4) => format!("http://{}:{}", v4, port),
        IpAddr::V6(v6) => format!("http://[{}]:{}", v6, port),
    };
    tracing::debug!(url = %url, "Detected primary endpoint");
    Some(AdvertisedEndpoint {
        url,
        interface: None,
    })
}

/// `host:port` of an endpoint URL
pub fn address_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

#[derive(Clone)]
pub struct EndpointPublisher {
    settings: Settings,
    monitor: TrafficMonitor,
    detected: Option<AdvertisedEndpoint>,
}

impl EndpointPublisher {
    pub fn with_detected(
        settings: Settings,
        monitor: TrafficMonitor,
        detected: Option<AdvertisedEndpoint>,
    ) -> Self {
        Self {
            settings,
            monitor,
            detected,
        }
    }

    /// Current endpoint list with load
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut advertised = self.settings.advertised_endpoints();
        if advertised.is_empty() {
            advertised.extend(self.detected.clone());
        }

        advertised
            .into_iter()
            .filter_map(|endpoint| {
                let Some(address) = address_of(&endpoint.url) else {
                    tracing::warn!(url = %endpoint.url, "Ignoring unparseable endpoint");
                    return None;
                };
                let load = self.monitor.load_for(endpoint.interface.as_deref());
                if !load.live {
                    tracing::debug!(url = %endpoint.url, "Endpoint interface has no live sample");
                }
                Some(EndpointInfo {
                    load_percent: load.overall(),
                    upload_load_percent: load.upload_percent,
                    download_load_percent: load.download_percent,
                    url: endpoint.url,
                    address,
                    interface: endpoint.interface,
                    reachable: load.live,
                })
            })
            .collect()
    }
}
