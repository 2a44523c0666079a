//! Interface throughput sampling
//!
//! Counters are read from the OS through `sysinfo` at a fixed interval;
//! the rate is the counter delta over the elapsed time relative to the
//! interface capacity. Received traffic is the load uploads compete with,
//! transmitted traffic the load downloads compete with.
//!
//! An interface whose last sample is older than the staleness window (it
//! vanished, or sampling stopped) is reported as not live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::Networks;

use crate::config::DEFAULT_INTERFACE_MBPS;

/// Sample periods without a fresh sample before an interface counts as down
pub const STALE_SAMPLE_PERIODS: u32 = 3;

/// Throughput of one interface over the last interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficSample {
    pub interface: String,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub capacity_mbps: u64,
    /// Busier direction
    pub load_percent: f64,
    /// Inbound share of capacity
    pub upload_load_percent: f64,
    /// Outbound share of capacity
    pub download_load_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Directional load of the link behind an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkLoad {
    pub upload_percent: f64,
    pub download_percent: f64,
    /// A sample inside the staleness window exists
    pub live: bool,
}

impl LinkLoad {
    pub fn overall(&self) -> f64 {
        self.upload_percent.max(self.download_percent)
    }
}

/// Raw cumulative counters of one interface
#[derive(Debug, Clone)]
pub struct InterfaceCounters {
    pub name: String,
    pub total_received: u64,
    pub total_transmitted: u64,
}

struct Previous {
    rx: u64,
    tx: u64,
    at: Instant,
}

#[derive(Clone)]
pub struct TrafficMonitor {
    inner: Arc<MonitorInner>,
}

struct Recorded {
    sample: TrafficSample,
    at: Instant,
}

struct MonitorInner {
    capacities: HashMap<String, u64>,
    sample_interval: Duration,
    previous: Mutex<HashMap<String, Previous>>,
    samples: RwLock<HashMap<String, Recorded>>,
}

/// Load of a link carrying `bytes_per_sec` with `capacity_mbps`, in percent
pub fn load_percent(bytes_per_sec: f64, capacity_mbps: u64) -> f64 {
    if capacity_mbps == 0 {
        return 100.0;
    }
    let capacity_bytes = capacity_mbps as f64 * 1_000_000.0 / 8.0;
    (bytes_per_sec / capacity_bytes * 100.0).clamp(0.0, 100.0)
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.eq_ignore_ascii_case("loopback")
}

impl TrafficMonitor {
    /// `capacities` maps interface names to Mbit/s
    pub fn new(capacities: HashMap<String, u64>) -> Self {
        Self::with_interval(capacities, Duration::from_secs(1))
    }

    /// Monitor sampling every `sample_interval`
    pub fn with_interval(capacities: HashMap<String, u64>, sample_interval: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                capacities,
                sample_interval,
                previous: Mutex::new(HashMap::new()),
                samples: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        self.inner.sample_interval
    }

    /// Age after which a sample no longer counts
    pub fn stale_after(&self) -> Duration {
        self.inner.sample_interval * STALE_SAMPLE_PERIODS
    }

    pub fn capacity_of(&self, interface: &str) -> u64 {
        self.inner
            .capacities
            .get(interface)
            .copied()
            .unwrap_or(DEFAULT_INTERFACE_MBPS)
    }

    /// Fold one set of counters taken at `at` into the published samples
    pub fn record(&self, counters: &[InterfaceCounters], at: Instant) {
        let now = Utc::now();
        let mut previous = self.inner.previous.lock();
        let mut samples = self.inner.samples.write();

        for c in counters {
            let rates = previous.get(&c.name).and_then(|prev| {
                let elapsed = at.checked_duration_since(prev.at)?.as_secs_f64();
                (elapsed > 0.0).then(|| {
                    (
                        c.total_received.saturating_sub(prev.rx) as f64 / elapsed,
                        c.total_transmitted.saturating_sub(prev.tx) as f64 / elapsed,
                    )
                })
            });

            previous.insert(
                c.name.clone(),
                Previous {
                    rx: c.total_received,
                    tx: c.total_transmitted,
                    at,
                },
            );

            let Some((rx, tx)) = rates else { continue };
            let capacity = self.capacity_of(&c.name);
            let upload = load_percent(rx, capacity);
            let download = load_percent(tx, capacity);

            samples.insert(
                c.name.clone(),
                Recorded {
                    sample: TrafficSample {
                        interface: c.name.clone(),
                        rx_bytes_per_sec: rx,
                        tx_bytes_per_sec: tx,
                        capacity_mbps: capacity,
                        load_percent: upload.max(download),
                        upload_load_percent: upload,
                        download_load_percent: download,
                        sampled_at: now,
                    },
                    at,
                },
            );
        }
    }

    /// Latest samples, sorted by interface name
    pub fn samples(&self) -> Vec<TrafficSample> {
        let mut samples: Vec<_> = self
            .inner
            .samples
            .read()
            .values()
            .map(|r| r.sample.clone())
            .collect();
        samples.sort_by(|a, b| a.interface.cmp(&b.interface));
        samples
    }

    /// Load attributed to an endpoint right now
    pub fn load_for(&self, interface: Option<&str>) -> LinkLoad {
        self.load_at(interface, Instant::now())
    }

    /// Load attributed to an endpoint as of `now`. A named interface must
    /// have a live sample; without a name the busiest live non-loopback
    /// interface counts, per direction.
    pub fn load_at(&self, interface: Option<&str>, now: Instant) -> LinkLoad {
        let stale_after = self.stale_after();
        let samples = self.inner.samples.read();
        let live = |r: &&Recorded| now.saturating_duration_since(r.at) <= stale_after;

        match interface {
            Some(name) => samples.get(name).filter(live).map_or_else(LinkLoad::default, |r| LinkLoad {
                upload_percent: r.sample.upload_load_percent,
                download_percent: r.sample.download_load_percent,
                live: true,
            }),
            None => samples
                .values()
                .filter(|r| !is_loopback(&r.sample.interface))
                .filter(live)
                .fold(LinkLoad::default(), |acc, r| LinkLoad {
                    upload_percent: acc.upload_percent.max(r.sample.upload_load_percent),
                    download_percent: acc.download_percent.max(r.sample.download_load_percent),
                    live: true,
                }),
        }
    }

    /// Sample the OS counters every sample interval
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut networks = Networks::new_with_refreshed_list();
            let mut ticker = tokio::time::interval(self.inner.sample_interval);

            loop {
                ticker.tick().await;
                networks.refresh();

                let counters: Vec<InterfaceCounters> = networks
                    .iter()
                    .map(|(name, data)| InterfaceCounters {
                        name: name.clone(),
                        total_received: data.total_received(),
                        total_transmitted: data.total_transmitted(),
                    })
                    .collect();

                self.record(&counters, Instant::now());
                tracing::trace!(interfaces = counters.len(), "Traffic sampled");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(name: &str, rx: u64, tx: u64) -> InterfaceCounters {
        InterfaceCounters {
            name: name.to_string(),
            total_received: rx,
            total_transmitted: tx,
        }
    }

    #[test]
    fn test_load_percent() {
        // 1000 Mbit/s = 125 MB/s
        assert_eq!(load_percent(62_500_000.0, 1000), 50.0);
        assert_eq!(load_percent(1e12, 1000), 100.0);
        assert_eq!(load_percent(1.0, 0), 100.0);
    }

    #[test]
    fn test_rates_from_counter_deltas() {
        let monitor = TrafficMonitor::new(HashMap::from([("eth0".to_string(), 100)]));
        let t0 = Instant::now();

        monitor.record(&[counters("eth0", 0, 0)], t0);
        assert!(monitor.samples().is_empty());

        // 100 Mbit/s = 12.5 MB/s; 2.5 MB/s sent over 2s
        monitor.record(&[counters("eth0", 1_000_000, 5_000_000)], t0 + Duration::from_secs(2));

        let samples = monitor.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].rx_bytes_per_sec, 500_000.0);
        assert_eq!(samples[0].tx_bytes_per_sec, 2_500_000.0);
        assert_eq!(samples[0].load_percent, 20.0);
        assert_eq!(samples[0].upload_load_percent, 4.0);
        assert_eq!(samples[0].download_load_percent, 20.0);

        let load = monitor.load_at(Some("eth0"), t0 + Duration::from_secs(2));
        assert!(load.live);
        assert_eq!(load.upload_percent, 4.0);
        assert_eq!(load.download_percent, 20.0);
        assert_eq!(load.overall(), 20.0);
    }

    #[test]
    fn test_stale_or_missing_interface_is_not_live() {
        let monitor = TrafficMonitor::with_interval(HashMap::new(), Duration::from_secs(1));
        let t0 = Instant::now();
        monitor.record(&[counters("eth0", 0, 0)], t0);
        monitor.record(&[counters("eth0", 0, 1_000)], t0 + Duration::from_secs(1));

        assert!(monitor.load_at(Some("eth0"), t0 + Duration::from_secs(2)).live);
        assert!(monitor.load_at(None, t0 + Duration::from_secs(2)).live);

        // The interface stops reporting
        let later = t0 + Duration::from_secs(10);
        assert_eq!(monitor.load_at(Some("eth0"), later), LinkLoad::default());
        assert!(!monitor.load_at(None, later).live);

        assert!(!monitor.load_at(Some("wlan9"), t0).live);
    }

    #[test]
    fn test_unattributed_load_ignores_loopback() {
        let monitor = TrafficMonitor::new(HashMap::new());
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);

        monitor.record(&[counters("lo", 0, 0), counters("eth0", 0, 0)], t0);
        monitor.record(
            &[counters("lo", 0, 125_000_000), counters("eth0", 0, 12_500_000)],
            t1,
        );

        assert_eq!(monitor.load_at(Some("lo"), t1).overall(), 100.0);
        assert_eq!(monitor.load_at(None, t1).download_percent, 10.0);
        assert_eq!(monitor.load_at(Some("wlan9"), t1).overall(), 0.0);
    }
}
