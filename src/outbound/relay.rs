//! Remote relay outbounds
//!
//! HTTP CONNECT and SOCKS5 upstream handshakes. The relay resolves the
//! destination itself, so the target is forwarded in host form whenever the
//! metadata still carries one.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Metadata, Stream};
use crate::error::{Error, Result};
use crate::transport::{TcpTransport, Transport};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Upper bound on a CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// HTTP CONNECT relay
pub struct HttpOutbound {
    name: String,
    server: Address,
    auth: Option<(String, String)>,
    transport: TcpTransport,
    alive: AtomicBool,
}

impl HttpOutbound {
    pub fn new(name: impl Into<String>, server: Address) -> Self {
        Self {
            name: name.into(),
            server,
            auth: None,
            transport: TcpTransport::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub async fn dial(&self, meta: &Metadata) -> Result<Stream> {
        let mut stream = self.transport.connect(&self.server).await?;

        let target = format!("{}:{}", meta.host(), meta.dst_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some((user, pass)) = &self.auth {
            let credentials = BASE64.encode(format!("{}:{}", user, pass));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::Protocol(format!("bad CONNECT response: {}", status_line)))?;
        if status != 200 {
            return Err(Error::Dial(format!(
                "{} refused CONNECT with {}",
                self.name, status
            )));
        }

        Ok(stream)
    }
}

/// Read an HTTP response head up to and including the blank line
async fn read_response_head(stream: &mut Stream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Protocol("CONNECT response head too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| Error::Protocol("non-UTF8 response head".into()))
}

/// SOCKS5 relay
pub struct Socks5Outbound {
    name: String,
    server: Address,
    auth: Option<(String, String)>,
    transport: TcpTransport,
    alive: AtomicBool,
}

impl Socks5Outbound {
    pub fn new(name: impl Into<String>, server: Address) -> Self {
        Self {
            name: name.into(),
            server,
            auth: None,
            transport: TcpTransport::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub async fn dial(&self, meta: &Metadata) -> Result<Stream> {
        let mut stream = self.transport.connect(&self.server).await?;

        // Method negotiation
        let offered = if self.auth.is_some() {
            vec![SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            vec![SOCKS5_VERSION, 1, AUTH_NONE]
        };
        stream.write_all(&offered).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!("bad SOCKS version {}", reply[0])));
        }
        match reply[1] {
            AUTH_NONE => {}
            AUTH_PASSWORD => self.authenticate(&mut stream).await?,
            method => {
                return Err(Error::Protocol(format!(
                    "unacceptable SOCKS auth method {}",
                    method
                )))
            }
        }

        // CONNECT request
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        encode_socks_addr(&mut request, meta);
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != REP_SUCCESS {
            return Err(Error::Dial(format!(
                "{} refused CONNECT with code {}",
                self.name, head[1]
            )));
        }
        let bound_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            atyp => return Err(Error::Protocol(format!("bad ATYP {} in reply", atyp))),
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }

    /// RFC 1929 username/password subnegotiation
    async fn authenticate(&self, stream: &mut Stream) -> Result<()> {
        let (user, pass) = self.auth.as_ref().ok_or_else(|| {
            Error::Protocol("server demanded auth but none is configured".into())
        })?;

        let mut message = vec![0x01, user.len() as u8];
        message.extend_from_slice(user.as_bytes());
        message.push(pass.len() as u8);
        message.extend_from_slice(pass.as_bytes());
        stream.write_all(&message).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(Error::Dial(format!("{} rejected credentials", self.name)));
        }
        Ok(())
    }
}

/// Append the destination in SOCKS5 address form, preferring the host when
/// the metadata still carries one
fn encode_socks_addr(buf: &mut Vec<u8>, meta: &Metadata) {
    if meta.has_host() {
        buf.push(ATYP_DOMAIN);
        buf.push(meta.dst_host.len() as u8);
        buf.extend_from_slice(meta.dst_host.as_bytes());
    } else {
        match meta.dst_ip {
            Some(IpAddr::V4(ip)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Some(IpAddr::V6(ip)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            None => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&[0, 0, 0, 0]);
            }
        }
    }
    buf.extend_from_slice(&meta.dst_port.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InboundKind;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });

        let outbound = HttpOutbound::new("up", Address::Socket(addr));
        let meta = Metadata::new(&Address::domain("example.com", 443), InboundKind::Http);
        assert!(outbound.dial(&meta).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let outbound = HttpOutbound::new("up", Address::Socket(addr));
        let meta = Metadata::new(&Address::domain("example.com", 443), InboundKind::Http);
        assert!(matches!(outbound.dial(&meta).await, Err(Error::Dial(_))));
    }

    #[tokio::test]
    async fn test_socks5_connect_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Greeting
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            // CONNECT with domain addressing
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.com");
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let outbound = Socks5Outbound::new("up", Address::Socket(addr));
        let meta = Metadata::new(&Address::domain("example.com", 443), InboundKind::Socks5);
        assert!(outbound.dial(&meta).await.is_ok());
    }

    #[tokio::test]
    async fn test_socks5_connect_failure_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            // Host unreachable
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let outbound = Socks5Outbound::new("up", Address::Socket(addr));
        let meta = Metadata::new(&Address::domain("example.com", 443), InboundKind::Socks5);
        assert!(matches!(outbound.dial(&meta).await, Err(Error::Dial(_))));
    }
}
