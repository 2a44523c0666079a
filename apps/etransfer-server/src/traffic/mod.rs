//! Traffic monitoring and endpoint publication

mod endpoints;
mod monitor;

pub use endpoints::{
    address_of, best_for, detected_endpoint, primary_address, EndpointInfo, EndpointPublisher, TransferDirection,
};
pub use monitor::{load_percent, InterfaceCounters, LinkLoad, TrafficMonitor, TrafficSample, STALE_SAMPLE_PERIODS};
