//! DNS Resolver
//!
//! Resolution order: static hosts map, cache, then the upstream `default`
//! group, with the `fallback` group consulted when the default answer is
//! distrusted by the fallback filter (GeoIP country / CIDR exclusions).
//! Concurrent queries for the same `(host, qtype)` coalesce to a single
//! upstream request. Reverse lookups are answered from the fake-IP pool only.

pub mod cache;
pub mod fakeip;
pub mod upstream;

pub use cache::DnsCache;
pub use fakeip::FakeIpPool;
pub use upstream::{Answer, DnsUpstream, UdpUpstream};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::geoip::GeoIpMatcher;

use cache::CacheKey;

/// Address record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueryType {
    A,
    Aaaa,
}

/// Distrust conditions for answers from the `default` upstream group.
///
/// A distrusted answer is replaced by the `fallback` group's answer when one
/// is configured.
#[derive(Default)]
pub struct FallbackFilter {
    /// Distrust answers outside `geoip_code`
    pub geoip: bool,
    pub geoip_code: String,
    /// Distrust answers inside any of these ranges
    pub ip_cidr: Vec<IpNet>,
    pub matcher: Arc<GeoIpMatcher>,
}

impl FallbackFilter {
    fn distrusts(&self, ips: &[IpAddr]) -> bool {
        if self
            .ip_cidr
            .iter()
            .any(|net| ips.iter().any(|ip| net.contains(ip)))
        {
            return true;
        }
        if self.geoip && self.matcher.is_loaded() {
            if let Some(first) = ips.first() {
                return !self.matcher.matches(&self.geoip_code, *first);
            }
        }
        false
    }
}

type SharedLookup = std::result::Result<Vec<IpAddr>, String>;

/// Host -> IP resolver with TTL cache and optional fake-IP mapping
pub struct Resolver {
    hosts: HashMap<String, IpAddr>,
    cache: DnsCache,
    fakeip: Option<Arc<FakeIpPool>>,
    default_group: Vec<Arc<dyn DnsUpstream>>,
    fallback_group: Vec<Arc<dyn DnsUpstream>>,
    fallback_filter: FallbackFilter,
    prefer_ipv6: bool,
    inflight: Mutex<HashMap<CacheKey, broadcast::Sender<SharedLookup>>>,
}

impl Resolver {
    pub fn new(default_group: Vec<Arc<dyn DnsUpstream>>) -> Self {
        Self {
            hosts: HashMap::new(),
            cache: DnsCache::new(),
            fakeip: None,
            default_group,
            fallback_group: Vec::new(),
            fallback_filter: FallbackFilter::default(),
            prefer_ipv6: false,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hosts(mut self, hosts: HashMap<String, IpAddr>) -> Self {
        self.hosts = hosts
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    pub fn with_fallback(
        mut self,
        group: Vec<Arc<dyn DnsUpstream>>,
        filter: FallbackFilter,
    ) -> Self {
        self.fallback_group = group;
        self.fallback_filter = filter;
        self
    }

    pub fn with_fake_ip(mut self, pool: Arc<FakeIpPool>) -> Self {
        self.fakeip = Some(pool);
        self
    }

    pub fn with_prefer_ipv6(mut self, prefer_ipv6: bool) -> Self {
        self.prefer_ipv6 = prefer_ipv6;
        self
    }

    /// The fake-IP pool, when fake-IP mode is enabled
    pub fn fake_ip_pool(&self) -> Option<&Arc<FakeIpPool>> {
        self.fakeip.as_ref()
    }

    /// Whether an address came out of the fake-IP pool
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match (ip, &self.fakeip) {
            (IpAddr::V4(v4), Some(pool)) => pool.contains(v4),
            _ => false,
        }
    }

    /// Reverse a fake IP to the host it encodes
    pub fn reverse(&self, ip: IpAddr) -> Option<String> {
        match (ip, &self.fakeip) {
            (IpAddr::V4(v4), Some(pool)) => pool.reverse(v4),
            _ => None,
        }
    }

    /// Resolve a host to all its addresses, preferred family first
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let host = host.to_lowercase();
        if let Some(&ip) = self.hosts.get(&host) {
            return Ok(vec![ip]);
        }

        if self.prefer_ipv6 {
            let v6 = self.lookup(&host, QueryType::Aaaa).await;
            let v4 = self.lookup(&host, QueryType::A).await;
            merge_families(v6, v4)
        } else {
            let v4 = self.lookup(&host, QueryType::A).await;
            match v4 {
                Ok(ips) => Ok(ips),
                Err(e) => self.lookup(&host, QueryType::Aaaa).await.map_err(|_| e),
            }
        }
    }

    /// Resolve to a single address; family preference first, response order
    /// breaking ties
    pub async fn resolve_ip(&self, host: &str) -> Result<IpAddr> {
        let ips = self.resolve(host).await?;
        ips.into_iter()
            .next()
            .ok_or_else(|| Error::Resolve(format!("no address for {}", host)))
    }

    /// One cached, coalesced lookup for a single record type
    async fn lookup(&self, host: &str, qtype: QueryType) -> Result<Vec<IpAddr>> {
        let key = CacheKey::new(host, qtype);
        if let Some(ips) = self.cache.get(&key) {
            return Ok(ips);
        }

        // Coalesce: the first task in becomes the leader; the rest subscribe.
        let rx = {
            let mut inflight = self.inflight.lock();
            if let Some(sender) = inflight.get(&key) {
                Some(sender.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.clone(), tx);
                None
            }
        };

        if let Some(mut rx) = rx {
            return match rx.recv().await {
                Ok(Ok(ips)) => Ok(ips),
                Ok(Err(message)) => Err(Error::Resolve(message)),
                Err(_) => Err(Error::Resolve("coalesced query aborted".into())),
            };
        }

        let outcome = self.query_upstreams(host, qtype).await;
        // Publish to the cache before releasing the in-flight slot so a
        // late subscriber that becomes a new leader hits the cache.
        if let Ok(answer) = &outcome {
            self.cache
                .insert(key.clone(), answer.ips.clone(), answer.min_ttl);
        }
        let shared: SharedLookup = match &outcome {
            Ok(answer) => Ok(answer.ips.clone()),
            Err(e) => Err(e.to_string()),
        };
        if let Some(sender) = self.inflight.lock().remove(&key) {
            let _ = sender.send(shared);
        }

        outcome.map(|answer| answer.ips)
    }

    async fn query_upstreams(&self, host: &str, qtype: QueryType) -> Result<Answer> {
        let default_answer = query_group(&self.default_group, host, qtype).await;

        match default_answer {
            Ok(answer) if !self.fallback_filter.distrusts(&answer.ips) => Ok(answer),
            Ok(answer) => {
                if self.fallback_group.is_empty() {
                    return Ok(answer);
                }
                debug!("default answer for {} distrusted, using fallback", host);
                query_group(&self.fallback_group, host, qtype).await
            }
            Err(e) => {
                if self.fallback_group.is_empty() {
                    return Err(e);
                }
                query_group(&self.fallback_group, host, qtype).await
            }
        }
    }
}

/// Query all members of a group concurrently; first success wins
async fn query_group(
    group: &[Arc<dyn DnsUpstream>],
    host: &str,
    qtype: QueryType,
) -> Result<Answer> {
    if group.is_empty() {
        return Err(Error::Resolve("no upstream configured".into()));
    }

    let mut set = JoinSet::new();
    for upstream in group {
        let upstream = Arc::clone(upstream);
        let host = host.to_string();
        set.spawn(async move { upstream.query(&host, qtype).await });
    }

    let mut last_err = Error::Resolve("all upstreams failed".into());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(answer)) => return Ok(answer),
            Ok(Err(e)) => last_err = e,
            Err(e) => last_err = Error::Resolve(e.to_string()),
        }
    }
    Err(last_err)
}

fn merge_families(
    preferred: Result<Vec<IpAddr>>,
    other: Result<Vec<IpAddr>>,
) -> Result<Vec<IpAddr>> {
    match (preferred, other) {
        (Ok(mut a), Ok(b)) => {
            a.extend(b);
            Ok(a)
        }
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockUpstream {
        ips: Vec<IpAddr>,
        ttl: u32,
        delay: Duration,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl MockUpstream {
        fn answering(ips: Vec<IpAddr>) -> (Arc<dyn DnsUpstream>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let upstream = Arc::new(Self {
                ips,
                ttl: 300,
                delay: Duration::ZERO,
                fail: false,
                calls: Arc::clone(&calls),
            });
            (upstream, calls)
        }

        fn failing() -> Arc<dyn DnsUpstream> {
            Arc::new(Self {
                ips: vec![],
                ttl: 0,
                delay: Duration::ZERO,
                fail: true,
                calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn slow(ips: Vec<IpAddr>, delay: Duration) -> (Arc<dyn DnsUpstream>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let upstream = Arc::new(Self {
                ips,
                ttl: 300,
                delay,
                fail: false,
                calls: Arc::clone(&calls),
            });
            (upstream, calls)
        }
    }

    #[async_trait]
    impl DnsUpstream for MockUpstream {
        async fn query(&self, _host: &str, qtype: QueryType) -> Result<Answer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(Error::Resolve("mock failure".into()));
            }
            let ips: Vec<IpAddr> = self
                .ips
                .iter()
                .copied()
                .filter(|ip| match qtype {
                    QueryType::A => ip.is_ipv4(),
                    QueryType::Aaaa => ip.is_ipv6(),
                })
                .collect();
            if ips.is_empty() {
                return Err(Error::Resolve("empty answer".into()));
            }
            Ok(Answer {
                ips,
                min_ttl: self.ttl,
            })
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = Resolver::new(vec![MockUpstream::failing()]);
        assert_eq!(resolver.resolve("1.2.3.4").await.unwrap(), vec![ip("1.2.3.4")]);
    }

    #[tokio::test]
    async fn test_hosts_map_wins() {
        let (upstream, calls) = MockUpstream::answering(vec![ip("9.9.9.9")]);
        let mut hosts = HashMap::new();
        hosts.insert("Router.LOCAL".to_string(), ip("192.168.1.1"));
        let resolver = Resolver::new(vec![upstream]).with_hosts(hosts);

        assert_eq!(
            resolver.resolve("router.local").await.unwrap(),
            vec![ip("192.168.1.1")]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_resolve_is_cached() {
        let (upstream, calls) = MockUpstream::answering(vec![ip("5.6.7.8")]);
        let resolver = Resolver::new(vec![upstream]);

        assert_eq!(resolver.resolve_ip("a.test").await.unwrap(), ip("5.6.7.8"));
        assert_eq!(resolver.resolve_ip("a.test").await.unwrap(), ip("5.6.7.8"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_queries_coalesce() {
        let (upstream, calls) =
            MockUpstream::slow(vec![ip("5.6.7.8")], Duration::from_millis(50));
        let resolver = Arc::new(Resolver::new(vec![upstream]));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            tasks.push(tokio::spawn(
                async move { resolver.resolve_ip("a.test").await },
            ));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), ip("5.6.7.8"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_on_distrusted_answer() {
        let (default_up, _) = MockUpstream::answering(vec![ip("8.8.8.8")]);
        let (fallback_up, fallback_calls) = MockUpstream::answering(vec![ip("10.10.10.10")]);

        let mut matcher = GeoIpMatcher::new();
        matcher.insert("CN", "1.0.0.0/8".parse().unwrap());
        let filter = FallbackFilter {
            geoip: true,
            geoip_code: "CN".to_string(),
            ip_cidr: vec![],
            matcher: Arc::new(matcher),
        };

        let resolver = Resolver::new(vec![default_up]).with_fallback(vec![fallback_up], filter);
        // 8.8.8.8 is outside 1.0.0.0/8, so the fallback answer is used.
        assert_eq!(resolver.resolve_ip("x.test").await.unwrap(), ip("10.10.10.10"));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cidr_exclusion_triggers_fallback() {
        let (default_up, _) = MockUpstream::answering(vec![ip("127.0.0.1")]);
        let (fallback_up, _) = MockUpstream::answering(vec![ip("10.10.10.10")]);
        let filter = FallbackFilter {
            geoip: false,
            geoip_code: String::new(),
            ip_cidr: vec!["127.0.0.0/8".parse().unwrap()],
            matcher: Arc::new(GeoIpMatcher::new()),
        };

        let resolver = Resolver::new(vec![default_up]).with_fallback(vec![fallback_up], filter);
        assert_eq!(resolver.resolve_ip("x.test").await.unwrap(), ip("10.10.10.10"));
    }

    #[tokio::test]
    async fn test_resolve_error_propagates() {
        let resolver = Resolver::new(vec![MockUpstream::failing()]);
        assert!(resolver.resolve("missing.test").await.is_err());
    }

    #[tokio::test]
    async fn test_fake_ip_reverse() {
        let pool = Arc::new(FakeIpPool::new("198.18.0.0/16".parse().unwrap()));
        let resolver =
            Resolver::new(vec![MockUpstream::failing()]).with_fake_ip(Arc::clone(&pool));

        let fake = pool.lookup("hidden.test");
        assert!(resolver.is_fake_ip(IpAddr::V4(fake)));
        assert_eq!(
            resolver.reverse(IpAddr::V4(fake)).as_deref(),
            Some("hidden.test")
        );
        assert!(!resolver.is_fake_ip(ip("1.2.3.4")));
    }
}
