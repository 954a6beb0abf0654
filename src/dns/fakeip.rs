//! Fake-IP pool
//!
//! A bijective host <-> IP map over a configured IPv4 CIDR, used to encode a
//! hostname into a synthetic address for transparent interception. Allocation
//! cycles through the pool; when full, the least-recently-used mapping is
//! evicted. Evicting an entry a live connection still references only breaks
//! the reverse lookup; the connection has already captured the original host.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

/// Bijective fake-IP pool with LRU eviction
pub struct FakeIpPool {
    network: Ipv4Net,
    inner: Mutex<Inner>,
}

struct Inner {
    host_to_ip: HashMap<String, Ipv4Addr>,
    ip_to_host: HashMap<Ipv4Addr, Mapping>,
    /// Cycling allocation cursor over the host range
    cursor: std::iter::Cycle<ipnet::Ipv4AddrRange>,
    capacity: usize,
    tick: u64,
}

struct Mapping {
    host: String,
    last_used: u64,
}

impl FakeIpPool {
    pub fn new(network: Ipv4Net) -> Self {
        let capacity = network.hosts().count();
        Self {
            network,
            inner: Mutex::new(Inner {
                host_to_ip: HashMap::new(),
                ip_to_host: HashMap::new(),
                cursor: network.hosts().cycle(),
                capacity,
                tick: 0,
            }),
        }
    }

    /// The pool's CIDR; reloads keep the pool when this is unchanged
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Whether an address belongs to the pool range
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    /// Map a host to its fake IP, allocating one if needed
    pub fn lookup(&self, host: &str) -> Ipv4Addr {
        let host = host.to_lowercase();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(&ip) = inner.host_to_ip.get(&host) {
            if let Some(mapping) = inner.ip_to_host.get_mut(&ip) {
                mapping.last_used = tick;
            }
            return ip;
        }

        let ip = if inner.ip_to_host.len() >= inner.capacity {
            inner.evict_lru()
        } else {
            inner.next_free()
        };

        inner.host_to_ip.insert(host.clone(), ip);
        inner.ip_to_host.insert(
            ip,
            Mapping {
                host,
                last_used: tick,
            },
        );
        ip
    }

    /// Reverse a fake IP back to its host, refreshing its recency
    pub fn reverse(&self, ip: Ipv4Addr) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let mapping = inner.ip_to_host.get_mut(&ip)?;
        mapping.last_used = tick;
        Some(mapping.host.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ip_to_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ip_to_host.is_empty()
    }
}

impl Inner {
    /// Advance the cursor to an unmapped address. The caller guarantees the
    /// pool is not full, so the cycle terminates.
    fn next_free(&mut self) -> Ipv4Addr {
        loop {
            let candidate = self.cursor.next().expect("pool range is not empty");
            if !self.ip_to_host.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Remove the least-recently-used mapping and return its address
    fn evict_lru(&mut self) -> Ipv4Addr {
        let victim = self
            .ip_to_host
            .iter()
            .min_by_key(|(_, m)| m.last_used)
            .map(|(&ip, _)| ip)
            .expect("full pool has at least one entry");
        if let Some(mapping) = self.ip_to_host.remove(&victim) {
            self.host_to_ip.remove(&mapping.host);
        }
        victim
    }
}
