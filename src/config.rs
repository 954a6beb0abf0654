//! Configuration module for ruletun
//!
//! JSON configuration. Rules use the compact `KIND,payload,target` line
//! form; proxies and groups are structured objects. Validation that needs
//! the whole picture (unknown outbound references, group cycles) happens
//! when snapshots are built, so a bad reload never unseats a good one.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rules::{Rule, RuleKind};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log configuration
    pub log: LogConfig,

    /// Control plane configuration
    pub api: Option<ApiConfig>,

    /// HTTP proxy inbound port
    pub port: Option<u16>,

    /// SOCKS inbound port
    #[serde(rename = "socks-port")]
    pub socks_port: Option<u16>,

    /// Address inbounds bind to
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Dispatch mode: rule / global / direct
    pub mode: Option<String>,

    /// Resolve the owning process of each connection (Process rules)
    #[serde(rename = "find-process")]
    pub find_process: bool,

    /// Path to a V2Ray-format geoip.dat; common locations are tried when
    /// unset
    #[serde(rename = "geoip-path")]
    pub geoip_path: Option<String>,

    /// DNS resolver configuration
    pub dns: Option<DnsConfig>,

    /// Remote relays and terminal outbounds
    pub proxies: Vec<ProxyConfig>,

    /// Proxy groups
    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Ordered rule lines: `KIND,payload,target` (`MATCH,target`)
    pub rules: Vec<String>,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: debug, info, warning, error, silent
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address, e.g. "127.0.0.1:9090"
    pub listen: String,

    /// Bearer secret; empty disables authentication
    #[serde(default)]
    pub secret: String,
}

/// One terminal outbound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,

    /// Outbound kind: http, socks5, direct, reject
    #[serde(rename = "type")]
    pub kind: String,

    /// Relay server host (http/socks5)
    pub server: Option<String>,

    /// Relay server port (http/socks5)
    pub port: Option<u16>,

    pub username: Option<String>,
    pub password: Option<String>,
}

/// One proxy group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyGroupConfig {
    pub name: String,

    /// Group kind: select, fallback, url-test, load-balance
    #[serde(rename = "type")]
    pub kind: String,

    /// Ordered child outbound names
    pub proxies: Vec<String>,

    /// Health probe URL
    pub url: Option<String>,

    /// Probe interval in seconds
    pub interval: Option<u64>,

    /// URL-test switch tolerance in milliseconds
    pub tolerance: Option<u32>,

    /// Load-balance strategy: consistent-hashing / round-robin
    pub strategy: Option<String>,
}

/// DNS resolver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Default upstream group, `ip[:port]` (port 53 assumed)
    pub nameserver: Vec<String>,

    /// Fallback upstream group
    pub fallback: Vec<String>,

    /// Distrust conditions for default answers
    #[serde(rename = "fallback-filter")]
    pub fallback_filter: Option<FallbackFilterConfig>,

    /// Static host mappings
    pub hosts: HashMap<String, String>,

    /// Fake-IP pool CIDR; enables fake-IP mode
    #[serde(rename = "fake-ip-range")]
    pub fake_ip_range: Option<String>,

    /// Prefer AAAA answers
    #[serde(rename = "prefer-ipv6")]
    pub prefer_ipv6: bool,
}

/// Fallback filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackFilterConfig {
    /// Distrust answers outside `geoip-code`
    #[serde(default)]
    pub geoip: bool,

    #[serde(rename = "geoip-code", default = "default_geoip_code")]
    pub geoip_code: String,

    /// Distrust answers inside these ranges
    #[serde(default)]
    pub ipcidr: Vec<String>,
}

fn default_geoip_code() -> String {
    "CN".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Parse the rule lines into ordered rules
    pub fn parse_rules(&self) -> Result<Vec<Rule>> {
        self.rules.iter().map(|line| parse_rule_line(line)).collect()
    }

    /// A minimal default: local inbounds, everything direct
    pub fn default_client() -> Self {
        Config {
            port: Some(7890),
            socks_port: Some(7891),
            api: Some(ApiConfig {
                listen: "127.0.0.1:9090".to_string(),
                secret: String::new(),
            }),
            rules: vec!["MATCH,DIRECT".to_string()],
            ..Default::default()
        }
    }
}

/// Parse one `KIND,payload,target` line; `MATCH,target` has no payload
pub fn parse_rule_line(line: &str) -> Result<Rule> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let (kind_text, payload, target) = match parts.as_slice() {
        [kind, target] => (*kind, "", *target),
        [kind, payload, target] => (*kind, *payload, *target),
        _ => return Err(Error::Config(format!("malformed rule: {}", line))),
    };

    let kind = RuleKind::from_str(kind_text)
        .ok_or_else(|| Error::Config(format!("unknown rule kind: {}", kind_text)))?;
    if kind == RuleKind::Match && !payload.is_empty() {
        return Err(Error::Config(format!("MATCH takes no payload: {}", line)));
    }
    if kind != RuleKind::Match && payload.is_empty() {
        return Err(Error::Config(format!("rule needs a payload: {}", line)));
    }
    Rule::new(kind, payload, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "port": 7890,
            "socks-port": 7891,
            "mode": "rule",
            "api": {"listen": "127.0.0.1:9090", "secret": "s"},
            "dns": {
                "nameserver": ["8.8.8.8", "1.1.1.1:53"],
                "fallback": ["9.9.9.9"],
                "fallback-filter": {"geoip": true, "ipcidr": ["240.0.0.0/4"]},
                "hosts": {"router.local": "192.168.1.1"},
                "fake-ip-range": "198.18.0.0/16"
            },
            "proxies": [
                {"name": "up1", "type": "socks5", "server": "10.0.0.2", "port": 1080},
                {"name": "up2", "type": "http", "server": "10.0.0.3", "port": 8080,
                 "username": "u", "password": "p"}
            ],
            "proxy-groups": [
                {"name": "auto", "type": "url-test", "proxies": ["up1", "up2"],
                 "url": "http://probe.test/ok", "interval": 300, "tolerance": 20}
            ],
            "rules": [
                "DOMAIN-SUFFIX,example.com,auto",
                "GEOIP,CN,DIRECT",
                "MATCH,DIRECT"
            ]
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.port, Some(7890));
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.proxy_groups[0].tolerance, Some(20));
        assert_eq!(config.dns.as_ref().unwrap().nameserver.len(), 2);

        let rules = config.parse_rules().unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].target(), "auto");
        assert_eq!(rules[2].kind(), RuleKind::Match);
    }

    #[test]
    fn test_rule_line_errors() {
        assert!(parse_rule_line("MATCH,DIRECT").is_ok());
        assert!(parse_rule_line("BOGUS,x,y").is_err());
        assert!(parse_rule_line("DOMAIN-SUFFIX,example.com").is_err());
        assert!(parse_rule_line("just-one-field").is_err());
        assert!(parse_rule_line("IP-CIDR,not-a-cidr,DIRECT").is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.rules, config.rules);
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.proxies.is_empty());
        assert_eq!(config.log.level, "info");
    }
}
