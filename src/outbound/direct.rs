//! Direct outbound - dial the destination itself

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;

use crate::common::{Address, Metadata, Stream};
use crate::dns::Resolver;
use crate::error::Result;
use crate::transport::{TcpTransport, Transport};

use super::PacketConn;

/// Direct connection to the destination, resolving the host through the
/// system's configured resolver when the metadata carries no IP.
pub struct DirectOutbound {
    name: String,
    transport: TcpTransport,
    alive: AtomicBool,
}

impl DirectOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TcpTransport::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    async fn target(&self, meta: &Metadata, resolver: &Resolver) -> Result<Address> {
        if let Some(ip) = meta.dst_ip {
            return Ok(Address::ip_port(ip, meta.dst_port));
        }
        let ip = resolver.resolve_ip(&meta.dst_host).await?;
        Ok(Address::ip_port(ip, meta.dst_port))
    }

    pub async fn dial(&self, meta: &Metadata, resolver: &Resolver) -> Result<Stream> {
        let target = self.target(meta, resolver).await?;
        self.transport.connect(&target).await
    }

    pub async fn dial_udp(&self, meta: &Metadata, resolver: &Resolver) -> Result<PacketConn> {
        let target = self.target(meta, resolver).await?;
        let bind: SocketAddr = match target {
            Address::Socket(addr) if addr.is_ipv6() => "[::]:0".parse().expect("valid bind"),
            _ => "0.0.0.0:0".parse().expect("valid bind"),
        };
        let socket = UdpSocket::bind(bind).await?;
        if let Address::Socket(addr) = target {
            socket.connect(addr).await?;
        }
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InboundKind;
    use crate::dns::Resolver;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn empty_resolver() -> Resolver {
        Resolver::new(vec![])
    }

    #[tokio::test]
    async fn test_dial_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let meta = Metadata::new(&Address::Socket(addr), InboundKind::Http);
        let outbound = DirectOutbound::new("direct");
        let mut stream = outbound.dial(&meta, &empty_resolver()).await.unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dial_host_uses_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut hosts = HashMap::new();
        hosts.insert("local.test".to_string(), addr.ip());
        let resolver = Resolver::new(vec![]).with_hosts(hosts);

        let meta = Metadata::new(&Address::domain("local.test", addr.port()), InboundKind::Http);
        let outbound = DirectOutbound::new("direct");
        assert!(outbound.dial(&meta, &resolver).await.is_ok());
    }

    #[tokio::test]
    async fn test_dial_unresolvable_host_fails() {
        let meta = Metadata::new(&Address::domain("nope.test", 80), InboundKind::Http);
        let outbound = DirectOutbound::new("direct");
        assert!(outbound.dial(&meta, &empty_resolver()).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_udp_round_trip() {
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(&buf[..n], from).await.unwrap();
        });

        let meta = Metadata::new(&Address::Socket(peer_addr), InboundKind::Socks5);
        let outbound = DirectOutbound::new("direct");
        let socket = outbound.dial_udp(&meta, &empty_resolver()).await.unwrap();

        socket.send(b"dgram").await.unwrap();
        let mut buf = [0u8; 5];
        socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"dgram");
    }
}
