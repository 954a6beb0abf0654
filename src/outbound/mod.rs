//! Outbound Layer
//!
//! Every entity that can dial a target on behalf of the dispatcher. An
//! outbound is a tagged variant over the fixed adapter kinds plus a group
//! variant whose payload holds child *names*, not owning references; this
//! keeps the dial hot path free of dynamic dispatch and makes cycle
//! detection a plain graph walk.

mod direct;
mod group;
mod prober;
mod reject;
mod relay;

pub use direct::DirectOutbound;
pub use group::{
    GroupKind, LoadBalanceStrategy, ProxyGroup, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_URL,
};
pub use prober::{probe_group, probe_once, spawn_probers, ProbeTarget, PROBE_TIMEOUT};
pub use reject::RejectOutbound;
pub use relay::{HttpOutbound, Socks5Outbound};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::UdpSocket;

use crate::common::{Metadata, Stream};
use crate::dns::Resolver;
use crate::error::{Error, Result};

/// Datagram leg of an outbound dial
pub type PacketConn = UdpSocket;

/// Outbound kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutboundKind {
    Direct,
    Reject,
    Http,
    Socks5,
    Selector,
    Fallback,
    #[serde(rename = "URLTest")]
    UrlTest,
    LoadBalance,
}

impl OutboundKind {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundKind::Direct => "Direct",
            OutboundKind::Reject => "Reject",
            OutboundKind::Http => "Http",
            OutboundKind::Socks5 => "Socks5",
            OutboundKind::Selector => "Selector",
            OutboundKind::Fallback => "Fallback",
            OutboundKind::UrlTest => "URLTest",
            OutboundKind::LoadBalance => "LoadBalance",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(
            self,
            OutboundKind::Selector
                | OutboundKind::Fallback
                | OutboundKind::UrlTest
                | OutboundKind::LoadBalance
        )
    }
}

/// A dialable outbound
pub enum Outbound {
    Direct(DirectOutbound),
    Reject(RejectOutbound),
    Http(HttpOutbound),
    Socks5(Socks5Outbound),
    Group(ProxyGroup),
}

impl Outbound {
    pub fn name(&self) -> &str {
        match self {
            Outbound::Direct(o) => o.name(),
            Outbound::Reject(o) => o.name(),
            Outbound::Http(o) => o.name(),
            Outbound::Socks5(o) => o.name(),
            Outbound::Group(g) => g.name(),
        }
    }

    pub fn kind(&self) -> OutboundKind {
        match self {
            Outbound::Direct(_) => OutboundKind::Direct,
            Outbound::Reject(_) => OutboundKind::Reject,
            Outbound::Http(_) => OutboundKind::Http,
            Outbound::Socks5(_) => OutboundKind::Socks5,
            Outbound::Group(g) => g.kind().outbound_kind(),
        }
    }

    /// Cached health belief; `false` biases group selection but never
    /// prevents a dial
    pub fn alive(&self) -> bool {
        match self {
            Outbound::Direct(o) => o.alive(),
            Outbound::Reject(_) => true,
            Outbound::Http(o) => o.alive(),
            Outbound::Socks5(o) => o.alive(),
            Outbound::Group(_) => true,
        }
    }

    pub fn set_alive(&self, alive: bool) {
        match self {
            Outbound::Direct(o) => o.set_alive(alive),
            Outbound::Http(o) => o.set_alive(alive),
            Outbound::Socks5(o) => o.set_alive(alive),
            Outbound::Reject(_) | Outbound::Group(_) => {}
        }
    }

    pub fn udp_supported(&self) -> bool {
        match self {
            Outbound::Direct(_) | Outbound::Reject(_) => true,
            Outbound::Http(_) | Outbound::Socks5(_) => false,
            Outbound::Group(_) => true,
        }
    }

    pub fn as_group(&self) -> Option<&ProxyGroup> {
        match self {
            Outbound::Group(g) => Some(g),
            _ => None,
        }
    }

    /// Dial the target described by the metadata. Groups never dial
    /// themselves; the dispatcher resolves a chain down to a terminal
    /// adapter first.
    pub async fn dial(&self, meta: &Metadata, resolver: &Resolver) -> Result<Stream> {
        match self {
            Outbound::Direct(o) => o.dial(meta, resolver).await,
            Outbound::Reject(o) => o.dial(meta).await,
            Outbound::Http(o) => o.dial(meta).await,
            Outbound::Socks5(o) => o.dial(meta).await,
            Outbound::Group(g) => Err(Error::Dial(format!(
                "group {} cannot be dialed directly",
                g.name()
            ))),
        }
    }

    /// Dial the datagram leg. Only adapters with `udp_supported` succeed.
    pub async fn dial_udp(&self, meta: &Metadata, resolver: &Resolver) -> Result<PacketConn> {
        match self {
            Outbound::Direct(o) => o.dial_udp(meta, resolver).await,
            _ => Err(Error::Unsupported(format!(
                "{} does not support UDP",
                self.name()
            ))),
        }
    }
}

/// The proxy set: every configured outbound and group, indexed by name.
///
/// Immutable once published; the hot-reload coordinator swaps whole sets.
pub struct ProxySet {
    outbounds: HashMap<String, Arc<Outbound>>,
    order: Vec<String>,
}

impl ProxySet {
    /// Build and validate a set: unique names, known children, no group
    /// reachable from itself.
    pub fn new(list: Vec<Outbound>) -> Result<Self> {
        let mut outbounds = HashMap::new();
        let mut order = Vec::new();

        for outbound in list {
            let name = outbound.name().to_string();
            if outbounds.insert(name.clone(), Arc::new(outbound)).is_some() {
                return Err(Error::Config(format!("duplicate outbound name: {}", name)));
            }
            order.push(name);
        }

        let set = Self { outbounds, order };
        set.validate_children()?;
        set.reject_cycles()?;
        Ok(set)
    }

    fn validate_children(&self) -> Result<()> {
        for outbound in self.outbounds.values() {
            if let Some(group) = outbound.as_group() {
                if group.children().is_empty() {
                    return Err(Error::Config(format!("group {} has no children", group.name())));
                }
                for child in group.children() {
                    if !self.outbounds.contains_key(child) {
                        return Err(Error::Config(format!(
                            "group {} references unknown outbound {}",
                            group.name(),
                            child
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth-first walk over group edges; a name revisited on the current
    /// path is a cycle.
    fn reject_cycles(&self) -> Result<()> {
        for name in &self.order {
            let mut path = HashSet::new();
            self.walk(name, &mut path)?;
        }
        Ok(())
    }

    fn walk<'a>(&'a self, name: &'a str, path: &mut HashSet<&'a str>) -> Result<()> {
        if !path.insert(name) {
            return Err(Error::Config(format!("proxy group cycle through {}", name)));
        }
        if let Some(group) = self.outbounds.get(name).and_then(|o| o.as_group()) {
            for child in group.children() {
                self.walk(child, path)?;
            }
        }
        path.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Outbound>> {
        self.outbounds.get(name)
    }

    /// Names in configuration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Outbound>> {
        self.order.iter().filter_map(|name| self.outbounds.get(name))
    }

    /// Groups in configuration order
    pub fn groups(&self) -> impl Iterator<Item = &Arc<Outbound>> {
        self.iter().filter(|o| o.as_group().is_some())
    }

    /// Walk group picks from `name` down to a terminal adapter.
    ///
    /// Returns the traversal chain (including `name` itself) and the
    /// terminal. Cycle rejection at construction bounds the walk.
    pub fn resolve_chain(
        &self,
        name: &str,
        meta: &Metadata,
    ) -> Result<(Vec<String>, Arc<Outbound>)> {
        let mut chain = Vec::new();
        let mut current = name.to_string();

        loop {
            let outbound = self
                .get(&current)
                .ok_or_else(|| Error::UnknownOutbound(current.clone()))?;
            chain.push(current.clone());

            match outbound.as_group() {
                Some(group) => {
                    group.touch();
                    current = group.pick(self, meta)?;
                }
                None => return Ok((chain, Arc::clone(outbound))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, InboundKind};

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

    fn meta() -> Metadata {
        Metadata::new(&Address::domain("example.com", 443), InboundKind::Http)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = ProxySet::new(vec![direct("a"), direct("a")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_child_rejected() {
        let result = ProxySet::new(vec![direct("a"), selector("g", &["a", "ghost"])]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        // g1 -> g2 -> g1
        let result = ProxySet::new(vec![
            direct("a"),
            selector("g1", &["g2", "a"]),
            selector("g2", &["g1"]),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let result = ProxySet::new(vec![selector("g", &["g"])]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_nested_groups_resolve() {
        let set = ProxySet::new(vec![
            direct("a"),
            selector("inner", &["a"]),
            selector("outer", &["inner"]),
        ])
        .unwrap();

        let (chain, terminal) = set.resolve_chain("outer", &meta()).unwrap();
        assert_eq!(chain, vec!["outer", "inner", "a"]);
        assert_eq!(terminal.name(), "a");
    }

    #[test]
    fn test_unknown_outbound_error() {
        let set = ProxySet::new(vec![direct("a")]).unwrap();
        assert!(matches!(
            set.resolve_chain("nope", &meta()),
            Err(Error::UnknownOutbound(_))
        ));
    }
}
