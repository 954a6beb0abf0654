//! Rule kinds and per-rule matching

use ipnet::IpNet;
use serde::Serialize;

use crate::common::Metadata;
use crate::error::{Error, Result};
use crate::geoip::GeoIpMatcher;

/// Rule type - determines how the payload is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleKind {
    Domain,
    DomainSuffix,
    DomainKeyword,
    #[serde(rename = "GeoIP")]
    GeoIp,
    #[serde(rename = "IPCIDR")]
    IpCidr,
    #[serde(rename = "SrcIPCIDR")]
    SrcIpCidr,
    DstPort,
    SrcPort,
    Process,
    Match,
}

impl RuleKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "DOMAIN" => Some(RuleKind::Domain),
            "DOMAIN-SUFFIX" | "DOMAINSUFFIX" => Some(RuleKind::DomainSuffix),
            "DOMAIN-KEYWORD" | "DOMAINKEYWORD" => Some(RuleKind::DomainKeyword),
            "GEOIP" => Some(RuleKind::GeoIp),
            "IP-CIDR" | "IPCIDR" => Some(RuleKind::IpCidr),
            "SRC-IP-CIDR" | "SRCIPCIDR" => Some(RuleKind::SrcIpCidr),
            "DST-PORT" | "DSTPORT" => Some(RuleKind::DstPort),
            "SRC-PORT" | "SRCPORT" => Some(RuleKind::SrcPort),
            "PROCESS-NAME" | "PROCESS" => Some(RuleKind::Process),
            "MATCH" | "FINAL" => Some(RuleKind::Match),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Domain => "Domain",
            RuleKind::DomainSuffix => "DomainSuffix",
            RuleKind::DomainKeyword => "DomainKeyword",
            RuleKind::GeoIp => "GeoIP",
            RuleKind::IpCidr => "IPCIDR",
            RuleKind::SrcIpCidr => "SrcIPCIDR",
            RuleKind::DstPort => "DstPort",
            RuleKind::SrcPort => "SrcPort",
            RuleKind::Process => "Process",
            RuleKind::Match => "Match",
        }
    }
}

/// One ordered routing rule
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    payload: String,
    target: String,
    // Parsed forms, validated at construction
    cidr: Option<IpNet>,
    port: Option<u16>,
}

impl Rule {
    /// Build a rule, validating the payload for its kind.
    /// A malformed CIDR or port is a configuration error.
    pub fn new(
        kind: RuleKind,
        payload: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<Self> {
        let payload = payload.into();
        let target = target.into();

        let mut cidr = None;
        let mut port = None;
        match kind {
            RuleKind::IpCidr | RuleKind::SrcIpCidr => {
                cidr = Some(payload.parse::<IpNet>().map_err(|_| {
                    Error::Config(format!("malformed CIDR in rule: {}", payload))
                })?);
            }
            RuleKind::DstPort | RuleKind::SrcPort => {
                port = Some(payload.parse::<u16>().map_err(|_| {
                    Error::Config(format!("malformed port in rule: {}", payload))
                })?);
            }
            _ => {}
        }

        Ok(Self {
            kind,
            payload,
            target,
            cidr,
            port,
        })
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the predicate reads the destination IP, so the engine must
    /// resolve a host-only destination before evaluating it
    pub fn requires_ip(&self) -> bool {
        matches!(
            self.kind,
            RuleKind::GeoIp | RuleKind::IpCidr | RuleKind::SrcIpCidr
        )
    }

    /// Evaluate the predicate against the metadata
    pub fn matches(&self, meta: &Metadata, geoip: &GeoIpMatcher) -> bool {
        match self.kind {
            RuleKind::Domain => {
                meta.has_host() && meta.dst_host.eq_ignore_ascii_case(&self.payload)
            }
            RuleKind::DomainSuffix => {
                if !meta.has_host() {
                    return false;
                }
                let host = meta.dst_host.to_lowercase();
                let suffix = self.payload.to_lowercase();
                host == suffix || host.ends_with(&format!(".{}", suffix))
            }
            RuleKind::DomainKeyword => {
                meta.has_host()
                    && meta
                        .dst_host
                        .to_lowercase()
                        .contains(&self.payload.to_lowercase())
            }
            RuleKind::GeoIp => meta
                .dst_ip
                .is_some_and(|ip| geoip.matches(&self.payload, ip)),
            RuleKind::IpCidr => {
                let cidr = self.cidr.expect("validated at construction");
                meta.dst_ip.is_some_and(|ip| cidr.contains(&ip))
            }
            RuleKind::SrcIpCidr => {
                let cidr = self.cidr.expect("validated at construction");
                meta.src_ip.is_some_and(|ip| cidr.contains(&ip))
            }
            RuleKind::DstPort => self.port == Some(meta.dst_port),
            RuleKind::SrcPort => self.port == Some(meta.src_port),
            RuleKind::Process => meta
                .process_name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(&self.payload)),
            RuleKind::Match => true,
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}) -> {}", self.kind.name(), self.payload, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, InboundKind};

    fn meta_host(host: &str, port: u16) -> Metadata {
        Metadata::new(&Address::domain(host, port), InboundKind::Socks5)
    }

    #[test]
    fn test_domain_suffix_boundaries() {
        let rule = Rule::new(RuleKind::DomainSuffix, "a.b", "P").unwrap();
        let geoip = GeoIpMatcher::new();

        assert!(rule.matches(&meta_host("x.a.b", 80), &geoip));
        assert!(rule.matches(&meta_host("a.b", 80), &geoip));
        assert!(!rule.matches(&meta_host("xa.b", 80), &geoip));
    }

    #[test]
    fn test_domain_matching_is_case_insensitive() {
        let geoip = GeoIpMatcher::new();
        let exact = Rule::new(RuleKind::Domain, "Example.Com", "P").unwrap();
        assert!(exact.matches(&meta_host("EXAMPLE.com", 80), &geoip));

        let keyword = Rule::new(RuleKind::DomainKeyword, "AMPL", "P").unwrap();
        assert!(keyword.matches(&meta_host("example.com", 80), &geoip));
    }

    #[test]
    fn test_malformed_cidr_is_config_error() {
        assert!(Rule::new(RuleKind::IpCidr, "10.0.0.0/99", "P").is_err());
        assert!(Rule::new(RuleKind::DstPort, "not-a-port", "P").is_err());
    }

    #[test]
    fn test_ip_cidr_needs_resolved_ip() {
        let rule = Rule::new(RuleKind::IpCidr, "10.0.0.0/8", "P").unwrap();
        let geoip = GeoIpMatcher::new();

        assert!(rule.requires_ip());
        // Host-only metadata: predicate cannot fire
        assert!(!rule.matches(&meta_host("a.test", 80), &geoip));

        let mut meta = meta_host("a.test", 80);
        meta.dst_ip = Some("10.1.2.3".parse().unwrap());
        assert!(rule.matches(&meta, &geoip));
    }

    #[test]
    fn test_port_rules() {
        let geoip = GeoIpMatcher::new();
        let dst = Rule::new(RuleKind::DstPort, "443", "P").unwrap();
        assert!(dst.matches(&meta_host("a.test", 443), &geoip));
        assert!(!dst.matches(&meta_host("a.test", 80), &geoip));

        let src = Rule::new(RuleKind::SrcPort, "5000", "P").unwrap();
        let mut meta = meta_host("a.test", 80);
        meta.src_port = 5000;
        assert!(src.matches(&meta, &geoip));
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(RuleKind::from_str("DOMAIN-SUFFIX"), Some(RuleKind::DomainSuffix));
        assert_eq!(RuleKind::from_str("geoip"), Some(RuleKind::GeoIp));
        assert_eq!(RuleKind::from_str("MATCH"), Some(RuleKind::Match));
        assert_eq!(RuleKind::from_str("bogus"), None);
    }
}
