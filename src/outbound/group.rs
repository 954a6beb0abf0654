//! Proxy groups - composite outbounds whose active child is chosen by policy
//!
//! All groups are themselves outbounds; nesting is allowed and cycles are
//! rejected when the proxy set is built. Policy state lives behind interior
//! mutability so the published set stays shareable by reference.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::common::Metadata;
use crate::error::{Error, Result};

use super::{OutboundKind, ProxySet};

/// Default probe interval (600 s)
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(600);
/// Default probe URL
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Group policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupKind {
    Selector,
    Fallback,
    #[serde(rename = "URLTest")]
    UrlTest,
    LoadBalance,
}

impl GroupKind {
    pub fn outbound_kind(&self) -> OutboundKind {
        match self {
            GroupKind::Selector => OutboundKind::Selector,
            GroupKind::Fallback => OutboundKind::Fallback,
            GroupKind::UrlTest => OutboundKind::UrlTest,
            GroupKind::LoadBalance => OutboundKind::LoadBalance,
        }
    }

    /// Whether a failed dial through this group warrants one retry against
    /// the group's next pick
    pub fn retries_on_failure(&self) -> bool {
        matches!(self, GroupKind::Fallback | GroupKind::UrlTest)
    }
}

/// Load-balance child selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    ConsistentHashing,
    RoundRobin,
}

/// Composite outbound whose dial delegates to one of its children
pub struct ProxyGroup {
    name: String,
    kind: GroupKind,
    children: Vec<String>,
    probe_url: String,
    interval: Duration,
    /// URL-test switch threshold in milliseconds
    tolerance: u32,
    strategy: LoadBalanceStrategy,
    state: GroupState,
}

#[derive(Default)]
struct GroupState {
    /// Selector: index of the chosen child
    selected: AtomicUsize,
    /// Load-balance round-robin cursor
    rr_cursor: AtomicUsize,
    /// URL-test sticky pick
    sticky: Mutex<Option<String>>,
    /// Last probe latency per child, milliseconds
    latencies: Mutex<HashMap<String, u32>>,
    /// Unix millis of the last dial through this group
    touched_at: AtomicU64,
}

impl ProxyGroup {
    pub fn new(name: impl Into<String>, kind: GroupKind, children: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            children,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            interval: DEFAULT_PROBE_INTERVAL,
            tolerance: 0,
            strategy: LoadBalanceStrategy::default(),
            state: GroupState::default(),
        }
    }

    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_tolerance(mut self, tolerance: u32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn probe_url(&self) -> &str {
        &self.probe_url
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a dial through this group, for UI exposure
    pub fn touch(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.state.touched_at.store(now_ms, Ordering::Relaxed);
    }

    pub fn touched_at(&self) -> u64 {
        self.state.touched_at.load(Ordering::Relaxed)
    }

    /// Pick a child name per the group's policy
    pub fn pick(&self, set: &ProxySet, meta: &Metadata) -> Result<String> {
        if self.children.is_empty() {
            return Err(Error::Config(format!("group {} has no children", self.name)));
        }
        let picked = match self.kind {
            GroupKind::Selector => {
                let index = self.state.selected.load(Ordering::Relaxed);
                self.children[index.min(self.children.len() - 1)].clone()
            }
            GroupKind::Fallback => self.pick_fallback(set),
            GroupKind::UrlTest => self.pick_url_test(set),
            GroupKind::LoadBalance => self.pick_load_balance(set, meta),
        };
        Ok(picked)
    }

    /// First child believed alive; the first child when none are
    fn pick_fallback(&self, set: &ProxySet) -> String {
        self.children
            .iter()
            .find(|child| child_alive(set, child))
            .unwrap_or(&self.children[0])
            .clone()
    }

    /// Lowest-latency child within the tolerance band; the current pick is
    /// sticky until its latency exceeds the best by more than `tolerance`.
    /// Ties break by insertion order.
    fn pick_url_test(&self, set: &ProxySet) -> String {
        let latencies = self.state.latencies.lock();
        let mut sticky = self.state.sticky.lock();

        let best = self
            .children
            .iter()
            .filter(|child| child_alive(set, child))
            .filter_map(|child| latencies.get(child.as_str()).map(|&ms| (child, ms)))
            .min_by_key(|&(_, ms)| ms);

        let Some((best_child, best_ms)) = best else {
            // No probe data yet: fall back to the first live child
            return sticky
                .clone()
                .unwrap_or_else(|| self.pick_fallback(set));
        };

        if let Some(current) = sticky.as_ref() {
            if child_alive(set, current) {
                if let Some(&current_ms) = latencies.get(current.as_str()) {
                    if current_ms <= best_ms.saturating_add(self.tolerance) {
                        return current.clone();
                    }
                }
            }
        }

        *sticky = Some(best_child.clone());
        best_child.clone()
    }

    /// Consistent hashing over `(src_ip, dst_host-or-ip)`, or round-robin;
    /// dead children are skipped by scanning forward
    fn pick_load_balance(&self, set: &ProxySet, meta: &Metadata) -> String {
        let n = self.children.len();
        let start = match self.strategy {
            LoadBalanceStrategy::ConsistentHashing => {
                let mut hasher = DefaultHasher::new();
                meta.src_ip.hash(&mut hasher);
                meta.host().hash(&mut hasher);
                (hasher.finish() as usize) % n
            }
            LoadBalanceStrategy::RoundRobin => {
                self.state.rr_cursor.fetch_add(1, Ordering::Relaxed) % n
            }
        };

        for offset in 0..n {
            let child = &self.children[(start + offset) % n];
            if child_alive(set, child) {
                return child.clone();
            }
        }
        self.children[start].clone()
    }

    /// Selector mutation; rejects names that are not children of this group
    pub fn select(&self, child: &str) -> Result<()> {
        if self.kind != GroupKind::Selector {
            return Err(Error::Config(format!(
                "{} is not a selector group",
                self.name
            )));
        }
        let index = self
            .children
            .iter()
            .position(|c| c == child)
            .ok_or_else(|| {
                Error::Config(format!("{} is not a child of {}", child, self.name))
            })?;
        self.state.selected.store(index, Ordering::Relaxed);
        Ok(())
    }

    /// The child a dial would use right now, for UI exposure
    pub fn now(&self, set: &ProxySet) -> String {
        self.pick(set, &Metadata::default()).unwrap_or_default()
    }

    /// Currently selected child name (selector only)
    pub fn selected(&self) -> Option<&str> {
        if self.kind != GroupKind::Selector {
            return None;
        }
        let index = self.state.selected.load(Ordering::Relaxed);
        self.children.get(index).map(String::as_str)
    }

    /// Restore a selector's choice across a hot reload
    pub fn restore_selection(&self, child: &str) -> bool {
        self.select(child).is_ok()
    }

    /// Record a probe outcome; `None` clears the child's latency
    pub fn record_latency(&self, child: &str, latency_ms: Option<u32>) {
        let mut latencies = self.state.latencies.lock();
        match latency_ms {
            Some(ms) => {
                latencies.insert(child.to_string(), ms);
            }
            None => {
                latencies.remove(child);
                let mut sticky = self.state.sticky.lock();
                if sticky.as_deref() == Some(child) {
                    *sticky = None;
                }
            }
        }
    }

    /// Last probe latency per child, for the UI
    pub fn latency_of(&self, child: &str) -> Option<u32> {
        self.state.latencies.lock().get(child).copied()
    }
}

fn child_alive(set: &ProxySet, child: &str) -> bool {
    set.get(child).map(|o| o.alive()).unwrap_or(false)
}
