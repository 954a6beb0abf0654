//! Prometheus-based metrics module
//!
//! Ambient counters exposed on the control plane's /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Dispatcher metrics ===

    /// Total connections handled by the dispatcher
    pub static ref DISPATCHER_CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "ruletun_dispatcher_connections_total",
        "Total number of connections handled by the dispatcher"
    ).unwrap();

    /// Currently active connections
    pub static ref DISPATCHER_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "ruletun_dispatcher_connections_active",
        "Number of currently active connections"
    ).unwrap();

    /// Connections that failed before the splice started
    pub static ref DISPATCHER_CONNECTIONS_FAILED: IntCounter = IntCounter::new(
        "ruletun_dispatcher_connections_failed",
        "Total number of failed connections"
    ).unwrap();

    // === Traffic metrics ===

    /// Total bytes uploaded (global)
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "ruletun_traffic_bytes_uploaded_total",
        "Total bytes uploaded"
    ).unwrap();

    /// Total bytes downloaded (global)
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "ruletun_traffic_bytes_downloaded_total",
        "Total bytes downloaded"
    ).unwrap();

    /// Datagrams dropped on UDP outbound failure
    pub static ref UDP_PACKETS_DROPPED: IntCounter = IntCounter::new(
        "ruletun_udp_packets_dropped_total",
        "Datagrams dropped on UDP outbound failure"
    ).unwrap();

    // === Rule metrics ===

    /// Matches per rule kind
    pub static ref RULE_MATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ruletun_rule_matches_total", "Rule matches by kind"),
        &["kind"]
    ).unwrap();

    // === Outbound metrics ===

    /// Dials per outbound
    pub static ref OUTBOUND_DIALS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ruletun_outbound_dials_total", "Dials per outbound"),
        &["name"]
    ).unwrap();

    /// Dial failures per outbound
    pub static ref OUTBOUND_DIAL_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("ruletun_outbound_dial_failures_total", "Dial failures per outbound"),
        &["name"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();
    REGISTRY.register(Box::new(UDP_PACKETS_DROPPED.clone())).ok();
    REGISTRY.register(Box::new(RULE_MATCHES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_DIALS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(OUTBOUND_DIAL_FAILURES.clone())).ok();
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00MB");
    }
}
