//! Hot-Reload Coordinator
//!
//! Rules, proxies and the resolver live in atomically swappable snapshots.
//! In-flight connections keep whatever snapshot they acquired; new
//! connections see the new one. A swap is one pointer store.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::dns::Resolver;
use crate::outbound::{spawn_probers, GroupKind, ProxySet};
use crate::rules::RuleEngine;

/// An atomically swappable, immutable-once-published snapshot
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// Acquire the current snapshot; holders keep it for as long as they
    /// need regardless of later swaps
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read())
    }

    /// Publish a new snapshot
    pub fn store(&self, value: Arc<T>) {
        *self.inner.write() = value;
    }
}

/// Owns the swappable snapshots and the lifecycle of the group probers
pub struct ReloadCoordinator {
    pub rules: Arc<SnapshotCell<RuleEngine>>,
    pub proxies: Arc<SnapshotCell<ProxySet>>,
    pub resolver: Arc<SnapshotCell<Resolver>>,
    prober_handles: Mutex<Vec<JoinHandle<()>>>,
    probing: std::sync::atomic::AtomicBool,
}

impl ReloadCoordinator {
    pub fn new(rules: RuleEngine, proxies: ProxySet, resolver: Resolver) -> Self {
        Self {
            rules: Arc::new(SnapshotCell::new(rules)),
            proxies: Arc::new(SnapshotCell::new(proxies)),
            resolver: Arc::new(SnapshotCell::new(resolver)),
            prober_handles: Mutex::new(Vec::new()),
            probing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Replace the rule set. Total order with respect to new dispatches;
    /// none with respect to dispatches already under way.
    pub fn swap_rules(&self, rules: RuleEngine) {
        self.rules.store(Arc::new(rules));
        info!("rules snapshot swapped");
    }

    /// Replace the proxy set. Selector choices survive when the group's
    /// name and chosen child do; all other per-group state resets. The
    /// probers of the old set are cancelled and new ones started.
    pub fn swap_proxies(&self, proxies: ProxySet) {
        let old = self.proxies.load();
        transfer_selections(&old, &proxies);
        self.proxies.store(Arc::new(proxies));
        info!("proxies snapshot swapped");
        self.respawn_probers();
    }

    /// Replace the resolver, preserving the fake-IP map when the pool CIDR
    /// is unchanged
    pub fn swap_resolver(&self, mut resolver: Resolver) {
        let old = self.resolver.load();
        if let (Some(old_pool), Some(new_pool)) =
            (old.fake_ip_pool(), resolver.fake_ip_pool())
        {
            if old_pool.network() == new_pool.network() {
                resolver = resolver.with_fake_ip(Arc::clone(old_pool));
            }
        }
        self.resolver.store(Arc::new(resolver));
        info!("resolver snapshot swapped");
    }

    /// Start probers for the current proxy set
    pub fn start_probers(&self) {
        self.probing.store(true, std::sync::atomic::Ordering::SeqCst);
        let handles = spawn_probers(self.proxies.load(), self.resolver.load());
        *self.prober_handles.lock() = handles;
    }

    /// Probes are cancelled on group replacement and restarted against the
    /// new set, but only once probing has been started at all
    fn respawn_probers(&self) {
        if !self.probing.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.stop_probers();
        self.start_probers();
    }

    /// Cancel all running probers
    pub fn stop_probers(&self) {
        for handle in self.prober_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ReloadCoordinator {
    fn drop(&mut self) {
        self.stop_probers();
    }
}

/// Carry selector choices from the old set into the new one. A selector
/// whose chosen child vanished resets to its first child.
fn transfer_selections(old: &ProxySet, new: &ProxySet) {
    for outbound in old.groups() {
        let Some(group) = outbound.as_group() else {
            continue;
        };
        if group.kind() != GroupKind::Selector {
            continue;
        }
        let Some(selected) = group.selected() else {
            continue;
        };
        if let Some(new_group) = new.get(group.name()).and_then(|o| o.as_group()) {
            if new_group.kind() == GroupKind::Selector {
                let _ = new_group.restore_selection(selected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::GeoIpMatcher;
    use crate::outbound::{DirectOutbound, Outbound, ProxyGroup};

    fn direct(name: &str) -> Outbound {
        Outbound::Direct(DirectOutbound::new(name))
    }

    fn selector(name: &str, children: &[&str]) -> Outbound {
        Outbound::Group(ProxyGroup::new(
            name,
            GroupKind::Selector,
            children.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn empty_engine() -> RuleEngine {
        RuleEngine::new(vec![], Arc::new(GeoIpMatcher::new()))
    }

    fn coordinator_with(proxies: ProxySet) -> ReloadCoordinator {
        ReloadCoordinator::new(empty_engine(), proxies, Resolver::new(vec![]))
    }

    #[test]
    fn test_snapshot_cell_swap_is_visible_to_new_loads() {
        let cell = SnapshotCell::new(1u32);
        let held = cell.load();
        cell.store(Arc::new(2));
        assert_eq!(*held, 1, "in-flight holders keep their snapshot");
        assert_eq!(*cell.load(), 2);
    }

    #[test]
    fn test_selector_choice_survives_swap() {
        let old = ProxySet::new(vec![direct("a"), direct("b"), selector("G", &["a", "b"])])
            .unwrap();
        old.get("G").unwrap().as_group().unwrap().select("b").unwrap();

        let coordinator = coordinator_with(old);
        let new = ProxySet::new(vec![direct("a"), direct("b"), selector("G", &["a", "b"])])
            .unwrap();
        coordinator.swap_proxies(new);

        let current = coordinator.proxies.load();
        assert_eq!(
            current.get("G").unwrap().as_group().unwrap().selected(),
            Some("b")
        );
        coordinator.stop_probers();
    }

    #[test]
    fn test_removed_child_resets_to_first() {
        let old = ProxySet::new(vec![direct("a"), direct("b"), selector("G", &["a", "b"])])
            .unwrap();
        old.get("G").unwrap().as_group().unwrap().select("b").unwrap();

        let coordinator = coordinator_with(old);
        let new = ProxySet::new(vec![direct("a"), direct("c"), selector("G", &["a", "c"])])
            .unwrap();
        coordinator.swap_proxies(new);

        let current = coordinator.proxies.load();
        assert_eq!(
            current.get("G").unwrap().as_group().unwrap().selected(),
            Some("a")
        );
        coordinator.stop_probers();
    }

    #[test]
    fn test_fake_ip_pool_survives_resolver_swap() {
        use crate::dns::FakeIpPool;
        use std::net::IpAddr;

        let pool = Arc::new(FakeIpPool::new("198.18.0.0/16".parse().unwrap()));
        let fake = pool.lookup("keep.test");

        let coordinator = ReloadCoordinator::new(
            empty_engine(),
            ProxySet::new(vec![direct("DIRECT")]).unwrap(),
            Resolver::new(vec![]).with_fake_ip(pool),
        );

        // Same CIDR: mappings carry over
        let replacement = Resolver::new(vec![]).with_fake_ip(Arc::new(FakeIpPool::new(
            "198.18.0.0/16".parse().unwrap(),
        )));
        coordinator.swap_resolver(replacement);
        assert_eq!(
            coordinator.resolver.load().reverse(IpAddr::V4(fake)).as_deref(),
            Some("keep.test")
        );

        // Different CIDR: fresh pool
        let replacement = Resolver::new(vec![]).with_fake_ip(Arc::new(FakeIpPool::new(
            "198.19.0.0/16".parse().unwrap(),
        )));
        coordinator.swap_resolver(replacement);
        assert_eq!(coordinator.resolver.load().reverse(IpAddr::V4(fake)), None);
    }
}
