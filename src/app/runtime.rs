//! Runtime - Configuration-driven assembly and lifecycle
//!
//! The runtime is responsible for:
//! - Turning a Config into validated snapshots (rules, proxies, resolver)
//! - Binding the inbound listeners and the control plane
//! - Shutdown: stop listeners, cancel splices, drain with a grace period

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::common::Address;
use crate::config::{Config, DnsConfig};
use crate::dns::{DnsUpstream, FakeIpPool, FallbackFilter, Resolver, UdpUpstream};
use crate::error::{Error, Result};
use crate::geoip::GeoIpMatcher;
use crate::inbound::{spawn_listener, Inbound, InboundProtocol};
use crate::logbus::{LogBus, LogLevel};
use crate::outbound::{
    DirectOutbound, GroupKind, HttpOutbound, LoadBalanceStrategy, Outbound, ProxyGroup,
    ProxySet, RejectOutbound, Socks5Outbound,
};
use crate::rules::{Rule, RuleEngine, RuleKind};
use crate::tunnel::{Dispatcher, Mode, Tracker};

use super::reload::ReloadCoordinator;

/// Grace period for splice drain on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Names every configuration gets for free
const BUILTIN_DIRECT: &str = "DIRECT";
const BUILTIN_REJECT: &str = "REJECT";

/// Build the three swappable snapshots from a config.
///
/// Any inconsistency (unknown outbound references, group cycles, malformed
/// CIDRs or addresses) is a `Config` error; the caller keeps whatever
/// snapshots it already has.
pub fn build_snapshots(config: &Config) -> Result<(RuleEngine, ProxySet, Resolver)> {
    let geoip = Arc::new(load_geoip(config));

    let proxies = build_proxies(config)?;
    let rules = build_rules(config, &proxies, Arc::clone(&geoip))?;
    let resolver = build_resolver(config.dns.as_ref(), &geoip)?;

    Ok((rules, proxies, resolver))
}

fn load_geoip(config: &Config) -> GeoIpMatcher {
    match &config.geoip_path {
        Some(path) => GeoIpMatcher::load(path).unwrap_or_else(|e| {
            warn!("{}", e);
            GeoIpMatcher::new()
        }),
        None => GeoIpMatcher::load_default(),
    }
}

fn build_proxies(config: &Config) -> Result<ProxySet> {
    let mut outbounds = vec![
        Outbound::Direct(DirectOutbound::new(BUILTIN_DIRECT)),
        Outbound::Reject(RejectOutbound::new(BUILTIN_REJECT)),
    ];

    for proxy in &config.proxies {
        outbounds.push(build_proxy(proxy)?);
    }
    for group in &config.proxy_groups {
        outbounds.push(build_group(group)?);
    }

    ProxySet::new(outbounds)
}

fn build_proxy(proxy: &crate::config::ProxyConfig) -> Result<Outbound> {
    let server = || -> Result<Address> {
        let host = proxy
            .server
            .as_deref()
            .ok_or_else(|| Error::Config(format!("proxy {} needs a server", proxy.name)))?;
        let port = proxy
            .port
            .ok_or_else(|| Error::Config(format!("proxy {} needs a port", proxy.name)))?;
        Ok(Address::parse(&format!("{}:{}", host, port))
            .ok_or_else(|| Error::Config(format!("proxy {} has a bad server", proxy.name)))?)
    };

    let outbound = match proxy.kind.to_lowercase().as_str() {
        "direct" => Outbound::Direct(DirectOutbound::new(&proxy.name)),
        "reject" => Outbound::Reject(RejectOutbound::new(&proxy.name)),
        "http" => {
            let mut relay = HttpOutbound::new(&proxy.name, server()?);
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                relay = relay.with_auth(user, pass);
            }
            Outbound::Http(relay)
        }
        "socks5" | "socks" => {
            let mut relay = Socks5Outbound::new(&proxy.name, server()?);
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                relay = relay.with_auth(user, pass);
            }
            Outbound::Socks5(relay)
        }
        kind => {
            return Err(Error::Config(format!(
                "proxy {} has unknown type {}",
                proxy.name, kind
            )))
        }
    };
    Ok(outbound)
}

fn build_group(group: &crate::config::ProxyGroupConfig) -> Result<Outbound> {
    let kind = match group.kind.to_lowercase().as_str() {
        "select" | "selector" => GroupKind::Selector,
        "fallback" => GroupKind::Fallback,
        "url-test" | "urltest" => GroupKind::UrlTest,
        "load-balance" | "loadbalance" => GroupKind::LoadBalance,
        kind => {
            return Err(Error::Config(format!(
                "group {} has unknown type {}",
                group.name, kind
            )))
        }
    };

    let mut built = ProxyGroup::new(&group.name, kind, group.proxies.clone());
    if let Some(url) = &group.url {
        built = built.with_probe_url(url);
    }
    if let Some(interval) = group.interval {
        built = built.with_interval(Duration::from_secs(interval));
    }
    if let Some(tolerance) = group.tolerance {
        built = built.with_tolerance(tolerance);
    }
    if let Some(strategy) = &group.strategy {
        let strategy = match strategy.to_lowercase().as_str() {
            "consistent-hashing" => LoadBalanceStrategy::ConsistentHashing,
            "round-robin" => LoadBalanceStrategy::RoundRobin,
            other => {
                return Err(Error::Config(format!(
                    "group {} has unknown strategy {}",
                    group.name, other
                )))
            }
        };
        built = built.with_strategy(strategy);
    }
    Ok(Outbound::Group(built))
}

fn build_rules(
    config: &Config,
    proxies: &ProxySet,
    geoip: Arc<GeoIpMatcher>,
) -> Result<RuleEngine> {
    let mut rules = config.parse_rules()?;

    for rule in &rules {
        if proxies.get(rule.target()).is_none() {
            return Err(Error::Config(format!(
                "rule references unknown outbound: {}",
                rule.target()
            )));
        }
    }

    // The terminal Match is mandatory; supply one when the config ends
    // without it
    let needs_terminal = rules
        .last()
        .map(|rule| rule.kind() != RuleKind::Match)
        .unwrap_or(true);
    if needs_terminal {
        rules.push(Rule::new(RuleKind::Match, "", BUILTIN_DIRECT)?);
    }

    Ok(RuleEngine::new(rules, geoip))
}

fn build_resolver(dns: Option<&DnsConfig>, geoip: &Arc<GeoIpMatcher>) -> Result<Resolver> {
    let Some(dns) = dns else {
        return Ok(Resolver::new(vec![]));
    };

    let default_group = parse_upstreams(&dns.nameserver)?;
    let fallback_group = parse_upstreams(&dns.fallback)?;

    let mut hosts = HashMap::new();
    for (name, ip) in &dns.hosts {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::Config(format!("bad hosts entry {}: {}", name, ip)))?;
        hosts.insert(name.clone(), ip);
    }

    let mut resolver = Resolver::new(default_group)
        .with_hosts(hosts)
        .with_prefer_ipv6(dns.prefer_ipv6);

    if !fallback_group.is_empty() {
        let filter = match &dns.fallback_filter {
            Some(filter) => FallbackFilter {
                geoip: filter.geoip,
                geoip_code: filter.geoip_code.clone(),
                ip_cidr: filter
                    .ipcidr
                    .iter()
                    .map(|cidr| {
                        cidr.parse()
                            .map_err(|_| Error::Config(format!("bad fallback CIDR: {}", cidr)))
                    })
                    .collect::<Result<Vec<_>>>()?,
                matcher: Arc::clone(geoip),
            },
            None => FallbackFilter::default(),
        };
        resolver = resolver.with_fallback(fallback_group, filter);
    }

    if let Some(range) = &dns.fake_ip_range {
        let network = range
            .parse()
            .map_err(|_| Error::Config(format!("bad fake-ip-range: {}", range)))?;
        resolver = resolver.with_fake_ip(Arc::new(FakeIpPool::new(network)));
    }

    Ok(resolver)
}

fn parse_upstreams(list: &[String]) -> Result<Vec<Arc<dyn DnsUpstream>>> {
    list.iter()
        .map(|entry| {
            let text = if entry.contains(':') {
                entry.clone()
            } else {
                format!("{}:53", entry)
            };
            let addr: SocketAddr = text
                .parse()
                .map_err(|_| Error::Config(format!("bad nameserver: {}", entry)))?;
            Ok(Arc::new(UdpUpstream::new(addr)) as Arc<dyn DnsUpstream>)
        })
        .collect()
}

/// Owns the HTTP and SOCKS inbound listener tasks, replaceable at runtime
/// through the control plane
pub struct ListenerManager {
    dispatcher: Option<Arc<Dispatcher>>,
    bind_address: IpAddr,
    shutdown_tx: broadcast::Sender<()>,
    http: Mutex<Option<(u16, JoinHandle<()>)>>,
    socks: Mutex<Option<(u16, JoinHandle<()>)>>,
}

impl ListenerManager {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        bind_address: IpAddr,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            bind_address,
            shutdown_tx,
            http: Mutex::new(None),
            socks: Mutex::new(None),
        }
    }

    /// A manager with no dispatcher; port changes are rejected. Used by
    /// control-plane tests that never accept traffic.
    pub fn disconnected() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            dispatcher: None,
            bind_address: IpAddr::from([127, 0, 0, 1]),
            shutdown_tx,
            http: Mutex::new(None),
            socks: Mutex::new(None),
        }
    }

    /// Currently bound `(http, socks)` ports
    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        (
            self.http.lock().as_ref().map(|(port, _)| *port),
            self.socks.lock().as_ref().map(|(port, _)| *port),
        )
    }

    pub async fn set_http_port(&self, port: u16) -> Result<()> {
        self.replace(&self.http, "http-in", InboundProtocol::Http, port)
            .await
    }

    pub async fn set_socks_port(&self, port: u16) -> Result<()> {
        self.replace(&self.socks, "socks-in", InboundProtocol::Socks, port)
            .await
    }

    async fn replace(
        &self,
        slot: &Mutex<Option<(u16, JoinHandle<()>)>>,
        tag: &str,
        protocol: InboundProtocol,
        port: u16,
    ) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| Error::Config("no listener manager attached".into()))?;

        if let Some((_, handle)) = slot.lock().take() {
            handle.abort();
        }

        let inbound = Arc::new(Inbound::new(
            tag,
            protocol,
            Address::ip_port(self.bind_address, port),
        ));
        let handle = spawn_listener(
            inbound,
            Arc::clone(dispatcher),
            self.shutdown_tx.subscribe(),
        )
        .await?;
        *slot.lock() = Some((port, handle));
        Ok(())
    }
}

/// The assembled application
pub struct Runtime {
    config: Config,
    config_path: Option<PathBuf>,
    coordinator: Arc<ReloadCoordinator>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<Tracker>,
    logbus: Arc<LogBus>,
    mode: Arc<RwLock<Mode>>,
    log_level: Arc<RwLock<LogLevel>>,
    listeners: Arc<ListenerManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build the runtime from configuration. Fails only on configuration
    /// errors; binding happens in [`Runtime::bind_inbounds`].
    pub fn from_config(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let (rules, proxies, resolver) = build_snapshots(&config)?;
        let coordinator = Arc::new(ReloadCoordinator::new(rules, proxies, resolver));

        let mode = match config.mode.as_deref() {
            Some(text) => Mode::from_str(text)
                .ok_or_else(|| Error::Config(format!("unknown mode: {}", text)))?,
            None => Mode::default(),
        };
        let mode = Arc::new(RwLock::new(mode));

        let log_level = LogLevel::from_str(&config.log.level)
            .ok_or_else(|| Error::Config(format!("unknown log level: {}", config.log.level)))?;
        let log_level = Arc::new(RwLock::new(log_level));

        let bind_address: IpAddr = config
            .bind_address
            .as_deref()
            .unwrap_or("127.0.0.1")
            .parse()
            .map_err(|_| {
                Error::Config(format!(
                    "bad bind-address: {}",
                    config.bind_address.as_deref().unwrap_or_default()
                ))
            })?;

        let tracker = Arc::new(Tracker::new());
        let logbus = Arc::new(LogBus::default());
        let (shutdown_tx, _) = broadcast::channel(4);

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&coordinator.rules),
                Arc::clone(&coordinator.proxies),
                Arc::clone(&coordinator.resolver),
                Arc::clone(&tracker),
                Arc::clone(&logbus),
                Arc::clone(&mode),
            )
            .with_process_lookup(config.find_process),
        );

        let listeners = Arc::new(ListenerManager::new(
            Arc::clone(&dispatcher),
            bind_address,
            shutdown_tx.clone(),
        ));

        Ok(Self {
            config,
            config_path,
            coordinator,
            dispatcher,
            tracker,
            logbus,
            mode,
            log_level,
            listeners,
            shutdown_tx,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the configured inbound listeners. A failure here is fatal for
    /// the launcher (exit code 2).
    pub async fn bind_inbounds(&self) -> Result<()> {
        if let Some(port) = self.config.port {
            self.listeners.set_http_port(port).await?;
        }
        if let Some(port) = self.config.socks_port {
            self.listeners.set_socks_port(port).await?;
        }
        Ok(())
    }

    /// Run until Ctrl-C, then shut down: stop listeners, cancel splices,
    /// drain with a grace period.
    pub async fn run(&self) -> Result<()> {
        crate::metrics::init_metrics();
        self.coordinator.start_probers();

        // 1 Hz traffic sampler
        let tracker = Arc::clone(&self.tracker);
        let mut sampler_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => { tracker.sample_once(); }
                    _ = sampler_shutdown.recv() => break,
                }
            }
        });

        // Control plane
        if let Some(api_config) = &self.config.api {
            let addr: SocketAddr = api_config
                .listen
                .parse()
                .map_err(|_| Error::Config(format!("bad api listen: {}", api_config.listen)))?;
            let state = ApiState {
                secret: api_config.secret.clone(),
                mode: Arc::clone(&self.mode),
                log_level: Arc::clone(&self.log_level),
                coordinator: Arc::clone(&self.coordinator),
                tracker: Arc::clone(&self.tracker),
                logbus: Arc::clone(&self.logbus),
                listeners: Arc::clone(&self.listeners),
                config_path: self.config_path.clone(),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = api::serve(addr, state, shutdown_rx).await {
                    error!("API server error: {}", e);
                }
            });
        }

        info!("ruletun started");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        let _ = self.shutdown_tx.send(());
        self.coordinator.stop_probers();
        self.tracker.close_all();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.tracker.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.tracker.is_empty() {
            warn!("{} connections did not drain in time", self.tracker.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json(json: &str) -> Config {
        Config::from_json(json).unwrap()
    }

    #[test]
    fn test_build_snapshots_with_builtins() {
        let config = config_json(r#"{"rules": ["MATCH,DIRECT"]}"#);
        let (rules, proxies, _resolver) = build_snapshots(&config).unwrap();
        assert!(proxies.get("DIRECT").is_some());
        assert!(proxies.get("REJECT").is_some());
        assert_eq!(rules.rules().len(), 1);
    }

    #[test]
    fn test_terminal_match_is_supplied() {
        let config = config_json(r#"{"rules": ["DST-PORT,22,REJECT"]}"#);
        let (rules, _, _) = build_snapshots(&config).unwrap();
        assert_eq!(rules.rules().len(), 2);
        assert_eq!(rules.rules().last().unwrap().kind(), RuleKind::Match);
        assert_eq!(rules.rules().last().unwrap().target(), "DIRECT");
    }

    #[test]
    fn test_unknown_rule_target_rejected() {
        let config = config_json(r#"{"rules": ["MATCH,GHOST"]}"#);
        assert!(matches!(
            build_snapshots(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_group_cycle_rejected_at_load() {
        // A self-including group never becomes a snapshot
        let config = config_json(
            r#"{
                "proxy-groups": [
                    {"name": "g1", "type": "select", "proxies": ["g2"]},
                    {"name": "g2", "type": "select", "proxies": ["g1"]}
                ]
            }"#,
        );
        assert!(matches!(build_snapshots(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_relay_without_server_rejected() {
        let config = config_json(r#"{"proxies": [{"name": "x", "type": "http"}]}"#);
        assert!(matches!(build_snapshots(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolver_from_dns_config() {
        let config = config_json(
            r#"{
                "dns": {
                    "nameserver": ["8.8.8.8"],
                    "hosts": {"a.test": "10.0.0.1"},
                    "fake-ip-range": "198.18.0.0/16"
                }
            }"#,
        );
        let (_, _, resolver) = build_snapshots(&config).unwrap();
        assert!(resolver.fake_ip_pool().is_some());
    }

    #[test]
    fn test_bad_nameserver_rejected() {
        let config = config_json(r#"{"dns": {"nameserver": ["not an ip"]}}"#);
        assert!(matches!(build_snapshots(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_runtime_binds_inbounds() {
        let config = config_json(r#"{"port": 0, "socks-port": 0}"#);
        let runtime = Runtime::from_config(config, None).unwrap();
        runtime.bind_inbounds().await.unwrap();
        let (http, socks) = runtime.listeners.ports();
        assert_eq!(http, Some(0));
        assert_eq!(socks, Some(0));
    }

    #[test]
    fn test_bad_mode_rejected() {
        let config = config_json(r#"{"mode": "chaos"}"#);
        assert!(Runtime::from_config(config, None).is_err());
    }
}
