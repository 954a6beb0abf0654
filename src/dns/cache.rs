//! DNS answer cache with TTL clamping
//!
//! Keys are case-normalized per RFC 4343. The effective TTL is the minimum
//! of the record TTLs, clamped to [60 s, 1 h].

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::QueryType;

/// Lower clamp for cached answers (60 s)
pub const MIN_TTL: Duration = Duration::from_secs(60);
/// Upper clamp for cached answers (1 h)
pub const MAX_TTL: Duration = Duration::from_secs(3600);

/// Cache key: lowercased name + query type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    qname: String,
    qtype: QueryType,
}

impl CacheKey {
    pub fn new(qname: &str, qtype: QueryType) -> Self {
        Self {
            qname: qname.to_lowercase(),
            qtype,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    ips: Vec<IpAddr>,
    expire_at: Instant,
}

/// TTL cache over resolved answers
#[derive(Default)]
pub struct DnsCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp a wire TTL into the cache bounds
    pub fn clamp_ttl(ttl_secs: u32) -> Duration {
        Duration::from_secs(u64::from(ttl_secs)).clamp(MIN_TTL, MAX_TTL)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<IpAddr>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expire_at > Instant::now() => Some(entry.ips.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: CacheKey, ips: Vec<IpAddr>, ttl_secs: u32) {
        let entry = CacheEntry {
            ips,
            expire_at: Instant::now() + Self::clamp_ttl(ttl_secs),
        };
        self.entries.lock().insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop everything; used when the resolver is hot-swapped
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_case_insensitive() {
        assert_eq!(
            CacheKey::new("Example.COM", QueryType::A),
            CacheKey::new("example.com", QueryType::A)
        );
        assert_ne!(
            CacheKey::new("example.com", QueryType::A),
            CacheKey::new("example.com", QueryType::Aaaa)
        );
    }

    #[test]
    fn test_ttl_clamping() {
        assert_eq!(DnsCache::clamp_ttl(1), MIN_TTL);
        assert_eq!(DnsCache::clamp_ttl(300), Duration::from_secs(300));
        assert_eq!(DnsCache::clamp_ttl(86_400), MAX_TTL);
    }

    #[test]
    fn test_insert_get() {
        let cache = DnsCache::new();
        let key = CacheKey::new("example.com", QueryType::A);
        let ips: Vec<IpAddr> = vec!["1.2.3.4".parse().unwrap()];

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), ips.clone(), 300);
        assert_eq!(cache.get(&key), Some(ips));
        assert_eq!(cache.len(), 1);
    }
}
