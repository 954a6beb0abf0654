//! GeoIP module - IP geolocation using V2Ray geoip.dat format
//!
//! Rules and DNS fallback filters ask "does this IP belong to country X".
//! The database is loaded from a V2Ray geoip.dat file via the geosite-rs
//! crate; entries can also be inserted programmatically (tests, config).

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use geosite_rs::{decode_geoip, Cidr};
use ipnet::IpNet;
use tracing::{debug, warn};

/// CIDR entry for IP matching
#[derive(Clone)]
struct CidrEntry {
    ip: IpAddr,
    prefix: u8,
}

impl CidrEntry {
    fn from_dat(cidr: &Cidr) -> Option<Self> {
        let ip = match cidr.ip.len() {
            4 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&cidr.ip);
                IpAddr::V4(Ipv4Addr::from(bytes))
            }
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&cidr.ip);
                IpAddr::V6(Ipv6Addr::from(bytes))
            }
            _ => return None,
        };
        Some(Self {
            ip,
            prefix: cidr.prefix as u8,
        })
    }

    fn from_net(net: &IpNet) -> Self {
        Self {
            ip: net.addr(),
            prefix: net.prefix_len(),
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let net_bits = u32::from(net);
                let ip_bits = u32::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix)
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net_bits = u128::from(net);
                let ip_bits = u128::from(ip);
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix)
                };
                (net_bits & mask) == (ip_bits & mask)
            }
            _ => false, // IPv4 vs IPv6 mismatch
        }
    }
}

/// GeoIP matcher: country code -> CIDR list
#[derive(Clone, Default)]
pub struct GeoIpMatcher {
    countries: HashMap<String, Vec<CidrEntry>>,
}

impl GeoIpMatcher {
    /// Create a new empty GeoIP matcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a CIDR under a country code
    pub fn insert(&mut self, country_code: &str, net: IpNet) {
        self.countries
            .entry(country_code.to_uppercase())
            .or_default()
            .push(CidrEntry::from_net(&net));
    }

    /// Load GeoIP database from a V2Ray geoip.dat file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;
        let geoip_list =
            decode_geoip(&data).map_err(|e| format!("Failed to parse {:?}: {}", path, e))?;

        let mut matcher = Self::new();
        for entry in &geoip_list.entry {
            let country_code = entry.country_code.to_uppercase();
            let cidrs: Vec<CidrEntry> = entry.cidr.iter().filter_map(CidrEntry::from_dat).collect();
            matcher.countries.insert(country_code, cidrs);
        }

        debug!(
            "Loaded {} countries from {:?}",
            matcher.countries.len(),
            path
        );
        Ok(matcher)
    }

    /// Try to load GeoIP database from common locations
    pub fn load_default() -> Self {
        let paths = [
            "geoip.dat",
            "/usr/share/v2ray/geoip.dat",
            "/usr/local/share/v2ray/geoip.dat",
            "/var/lib/v2ray/geoip.dat",
        ];

        for path in paths {
            if Path::new(path).exists() {
                match Self::load(path) {
                    Ok(matcher) => {
                        debug!("Loaded GeoIP database from {}", path);
                        return matcher;
                    }
                    Err(e) => {
                        warn!("Failed to load GeoIP database from {}: {}", path, e);
                    }
                }
            }
        }

        debug!("No GeoIP database found, GEOIP rules will not match");
        Self::new()
    }

    /// Check if an IP address belongs to a country (ISO 3166-1 alpha-2)
    pub fn matches(&self, country_code: &str, ip: IpAddr) -> bool {
        let country_code = country_code.to_uppercase();
        self.countries
            .get(&country_code)
            .is_some_and(|cidrs| cidrs.iter().any(|c| c.contains(ip)))
    }

    /// Get the country code for an IP address
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        for (country, cidrs) in &self.countries {
            if cidrs.iter().any(|c| c.contains(ip)) {
                return Some(country);
            }
        }
        None
    }

    /// Check if any database entries are loaded
    pub fn is_loaded(&self) -> bool {
        !self.countries.is_empty()
    }
}
