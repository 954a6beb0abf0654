//! HTTP proxy inbound shim
//!
//! Two modes behind one handshake:
//! - CONNECT: reply 200 and hand over the raw tunnel
//! - plain proxy-form request: rewrite the URI to origin form, strip the
//!   hop-by-hop proxy headers, and replay the rewritten head ahead of the
//!   client's remaining bytes

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, InboundKind, Metadata, PrependStream, Stream};
use crate::error::{Error, Result};

/// Upper bound on a request head
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Headers the proxy consumes instead of forwarding
const HOP_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Accept one HTTP proxy request and produce `(metadata, stream)`
pub async fn handshake(mut stream: Stream) -> Result<(Metadata, Stream)> {
    let head = read_request_head(&mut stream).await?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Protocol("empty request line".into()))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::Protocol("request line has no URI".into()))?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = Address::parse(uri)
            .ok_or_else(|| Error::InvalidAddress(uri.to_string()))?;
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        let metadata = Metadata::new(&target, InboundKind::Http);
        return Ok((metadata, stream));
    }

    // Plain proxy-form request: METHOD http://host[:port]/path
    let (target, origin_form) = split_proxy_uri(uri)?;

    let mut rewritten = format!("{} {} {}\r\n", method, origin_form, version);
    for line in lines {
        if line.is_empty() {
            break;
        }
        let name = line.split(':').next().unwrap_or_default().trim();
        if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    // One request per inbound connection
    rewritten.push_str("Connection: close\r\n\r\n");

    let metadata = Metadata::new(&target, InboundKind::Http);
    let stream: Stream = Box::new(PrependStream::new(rewritten.into_bytes(), stream));
    Ok((metadata, stream))
}

/// Read a request head up to and including the blank line
async fn read_request_head(stream: &mut Stream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_REQUEST_HEAD {
            return Err(Error::Protocol("request head too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| Error::Protocol("non-UTF8 request head".into()))
}

/// Split a proxy-form URI into the target address and origin-form path
fn split_proxy_uri(uri: &str) -> Result<(Address, String)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| Error::Protocol(format!("expected absolute http URI, got {}", uri)))?;

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };

    if authority.is_empty() {
        return Err(Error::InvalidAddress("empty host".into()));
    }
    let has_port = authority
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        Address::parse(authority).ok_or_else(|| Error::InvalidAddress(authority.into()))?
    } else {
        Address::parse(&format!("{}:80", authority))
            .ok_or_else(|| Error::InvalidAddress(authority.into()))?
    };

    Ok((target, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn run_handshake(request: &[u8]) -> Result<(Metadata, Stream, tokio::io::DuplexStream)> {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(request).await.unwrap();
        let (meta, stream) = handshake(Box::new(server)).await?;
        Ok((meta, stream, client))
    }

    #[tokio::test]
    async fn test_connect_tunnel() {
        let (meta, _stream, mut client) =
            run_handshake(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await
                .unwrap();

        assert_eq!(meta.inbound_kind, InboundKind::Http);
        assert_eq!(meta.dst_host, "example.com");
        assert_eq!(meta.dst_port, 443);

        let mut buf = [0u8; 39];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_connect_ip_literal() {
        let (meta, _stream, _client) =
            run_handshake(b"CONNECT 1.2.3.4:8443 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
        assert!(!meta.has_host());
        assert_eq!(meta.dst_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(meta.dst_port, 8443);
    }

    #[tokio::test]
    async fn test_plain_request_is_rewritten() {
        let (meta, mut stream, _client) = run_handshake(
            b"GET http://example.com/api?x=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap();

        assert_eq!(meta.dst_host, "example.com");
        assert_eq!(meta.dst_port, 80);

        // The rewritten head is replayed ahead of the client bytes
        let mut replayed = vec![0u8; 256];
        let n = stream.read(&mut replayed).await.unwrap();
        let text = String::from_utf8_lossy(&replayed[..n]).to_string();
        assert!(text.starts_with("GET /api?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.to_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_plain_request_with_port() {
        let (meta, _stream, _client) =
            run_handshake(b"GET http://example.com:8080/ HTTP/1.1\r\nHost: h\r\n\r\n")
                .await
                .unwrap();
        assert_eq!(meta.dst_port, 8080);
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let result = run_handshake(b"NONSENSE\r\n\r\n").await;
        assert!(result.is_err());
    }
}
