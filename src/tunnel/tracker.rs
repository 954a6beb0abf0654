//! Connection Tracker - registry of live splices and traffic accountant
//!
//! The tracker weakly references a connection: it holds the shared counters
//! and the cancel token, never the sockets. Closing an entry requests the
//! splice to stop; the dispatcher deregisters when the splice returns.
//!
//! A 1 Hz sampler turns the global counter deltas into `(up_bps, down_bps)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::common::{CancelToken, Metadata};

/// Point-in-time view of one live connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub metadata: Metadata,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
    pub upload: u64,
    pub download: u64,
    pub start: u64,
}

struct TrackedEntry {
    metadata: Metadata,
    chains: Vec<String>,
    rule: String,
    rule_payload: String,
    upload: Arc<AtomicU64>,
    download: Arc<AtomicU64>,
    start: u64,
    cancel: CancelToken,
}

/// Registry of live connections plus global throughput accounting
#[derive(Default)]
pub struct Tracker {
    connections: DashMap<Uuid, TrackedEntry>,
    global_up: Arc<AtomicU64>,
    global_down: Arc<AtomicU64>,
    last_up: AtomicU64,
    last_down: AtomicU64,
    rate_up: AtomicU64,
    rate_down: AtomicU64,
    udp_drops: AtomicU64,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global upload accumulator, shared with every splice counter
    pub fn global_up(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.global_up)
    }

    /// Global download accumulator, shared with every splice counter
    pub fn global_down(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.global_down)
    }

    /// Register a connection after a successful outbound dial
    #[allow(clippy::too_many_arguments)]
    pub fn track(
        &self,
        id: Uuid,
        metadata: Metadata,
        chains: Vec<String>,
        rule: String,
        rule_payload: String,
        upload: Arc<AtomicU64>,
        download: Arc<AtomicU64>,
        cancel: CancelToken,
    ) {
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.connections.insert(
            id,
            TrackedEntry {
                metadata,
                chains,
                rule,
                rule_payload,
                upload,
                download,
                start,
                cancel,
            },
        );
    }

    /// Deregister; called when the splice ends
    pub fn untrack(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    /// Request one connection's splice to stop. Returns false for an
    /// unknown id.
    pub fn close(&self, id: Uuid) -> bool {
        match self.connections.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Request every live splice to stop
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.cancel.cancel();
        }
    }

    /// Snapshot of every live connection
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| ConnectionSnapshot {
                id: *entry.key(),
                metadata: entry.metadata.clone(),
                chains: entry.chains.clone(),
                rule: entry.rule.clone(),
                rule_payload: entry.rule_payload.clone(),
                upload: entry.upload.load(Ordering::Relaxed),
                download: entry.download.load(Ordering::Relaxed),
                start: entry.start,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Lifetime totals across all connections, live and closed
    pub fn totals(&self) -> (u64, u64) {
        (
            self.global_up.load(Ordering::Relaxed),
            self.global_down.load(Ordering::Relaxed),
        )
    }

    /// One sampler tick: the delta since the previous tick becomes the
    /// published rate. Runs at 1 Hz.
    pub fn sample_once(&self) -> (u64, u64) {
        let up_total = self.global_up.load(Ordering::Relaxed);
        let down_total = self.global_down.load(Ordering::Relaxed);
        let up = up_total.saturating_sub(self.last_up.swap(up_total, Ordering::Relaxed));
        let down = down_total.saturating_sub(self.last_down.swap(down_total, Ordering::Relaxed));
        self.rate_up.store(up, Ordering::Relaxed);
        self.rate_down.store(down, Ordering::Relaxed);
        (up, down)
    }

    /// The most recently sampled `(up_bps, down_bps)`
    pub fn rates(&self) -> (u64, u64) {
        (
            self.rate_up.load(Ordering::Relaxed),
            self.rate_down.load(Ordering::Relaxed),
        )
    }

    /// Datagram silently dropped on UDP outbound failure
    pub fn record_udp_drop(&self) {
        self.udp_drops.fetch_add(1, Ordering::Relaxed);
        crate::metrics::UDP_PACKETS_DROPPED.inc();
    }

    pub fn udp_drops(&self) -> u64 {
        self.udp_drops.load(Ordering::Relaxed)
    }
}
