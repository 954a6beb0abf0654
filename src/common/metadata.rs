//! Metadata - the classification key of a connection
//!
//! Rule evaluation ONLY depends on Metadata, never on Stream or IO.

use std::net::IpAddr;

use serde::Serialize;

use super::Address;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Which kind of inbound accepted the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InboundKind {
    #[default]
    Http,
    Socks4,
    Socks5,
    Redir,
    Tproxy,
    Tun,
}

impl std::fmt::Display for InboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InboundKind::Http => "HTTP",
            InboundKind::Socks4 => "SOCKS4",
            InboundKind::Socks5 => "SOCKS5",
            InboundKind::Redir => "REDIR",
            InboundKind::Tproxy => "TPROXY",
            InboundKind::Tun => "TUN",
        };
        write!(f, "{}", s)
    }
}

/// Metadata extracted when a connection is accepted.
///
/// Invariant: at least one of `dst_host`, `dst_ip` is set; `dst_port` is
/// always set. After the dispatcher's resolution pass, rules that need an
/// IP see `dst_ip` populated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metadata {
    pub network: Network,
    #[serde(rename = "type")]
    pub inbound_kind: InboundKind,
    #[serde(rename = "sourceIP")]
    pub src_ip: Option<IpAddr>,
    #[serde(rename = "sourcePort")]
    pub src_port: u16,
    /// Destination hostname; empty when the client supplied an IP literal
    #[serde(rename = "host")]
    pub dst_host: String,
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,
    #[serde(rename = "processName", skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
}

impl Metadata {
    /// Create metadata for a target address
    pub fn new(target: &Address, kind: InboundKind) -> Self {
        let mut meta = Self {
            inbound_kind: kind,
            dst_port: target.port(),
            ..Default::default()
        };
        match target {
            Address::Socket(addr) => meta.dst_ip = Some(addr.ip()),
            Address::Domain(domain, _) => meta.dst_host = domain.clone(),
        }
        meta
    }

    /// Builder: set network type
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Builder: set source endpoint
    pub fn with_source(mut self, ip: IpAddr, port: u16) -> Self {
        self.src_ip = Some(ip);
        self.src_port = port;
        self
    }

    /// True when the destination hostname is known
    pub fn has_host(&self) -> bool {
        !self.dst_host.is_empty()
    }

    /// The address an outbound should dial: the hostname when known,
    /// otherwise the resolved / literal IP.
    pub fn dial_address(&self) -> Address {
        if self.has_host() {
            Address::domain(&self.dst_host, self.dst_port)
        } else {
            // Invariant guarantees dst_ip here; unspecified is a safe fallback
            let ip = self
                .dst_ip
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            Address::ip_port(ip, self.dst_port)
        }
    }

    /// Host-or-ip display form of the destination
    pub fn host(&self) -> String {
        if self.has_host() {
            self.dst_host.clone()
        } else {
            self.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
        }
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host(), self.dst_port)
    }
}
