//! SOCKS inbound shim
//!
//! SOCKS4, SOCKS4a and SOCKS5 CONNECT, sniffed from the version byte.
//! No inbound authentication; only the target address is extracted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, InboundKind, Metadata, Stream};
use crate::error::{Error, Result};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Accept one SOCKS request and produce `(metadata, stream)`
pub async fn handshake(mut stream: Stream) -> Result<(Metadata, Stream)> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;

    match version[0] {
        SOCKS4_VERSION => handshake_v4(stream).await,
        SOCKS5_VERSION => handshake_v5(stream).await,
        v => Err(Error::Protocol(format!("unsupported SOCKS version: {}", v))),
    }
}

/// SOCKS4/4a: CD DSTPORT DSTIP USERID NUL [HOSTNAME NUL]
async fn handshake_v4(mut stream: Stream) -> Result<(Metadata, Stream)> {
    let mut head = [0u8; 7];
    stream.read_exact(&mut head).await?;

    let command = head[0];
    if command != CMD_CONNECT {
        stream.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await?;
        return Err(Error::Protocol(format!("SOCKS4 command {} unsupported", command)));
    }

    let port = u16::from_be_bytes([head[1], head[2]]);
    let ip = Ipv4Addr::new(head[3], head[4], head[5], head[6]);

    // USERID is NUL-terminated and ignored
    read_until_nul(&mut stream).await?;

    // SOCKS4a signals a hostname with 0.0.0.x (x != 0)
    let target = if ip.octets()[..3] == [0, 0, 0] && ip.octets()[3] != 0 {
        let host = read_until_nul(&mut stream).await?;
        Address::domain(host, port)
    } else {
        Address::ip_port(IpAddr::V4(ip), port)
    };

    stream.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await?;
    Ok((Metadata::new(&target, InboundKind::Socks4), stream))
}

/// SOCKS5: method negotiation, then a CONNECT request
async fn handshake_v5(mut stream: Stream) -> Result<(Metadata, Stream)> {
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::Protocol("no acceptable SOCKS auth method".into()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("bad SOCKS5 request version".into()));
    }
    if head[1] != CMD_CONNECT {
        stream
            .write_all(&[SOCKS5_VERSION, REP_CMD_NOT_SUPPORTED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await?;
        return Err(Error::Protocol(format!("SOCKS5 command {} unsupported", head[1])));
    }

    let target = match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Address::ip_port(IpAddr::V4(ip), port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Address::ip_port(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let host = String::from_utf8(buf[..len[0] as usize].to_vec())
                .map_err(|_| Error::Protocol("non-UTF8 SOCKS5 hostname".into()))?;
            let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
            Address::domain(host, port)
        }
        atyp => return Err(Error::Protocol(format!("bad SOCKS5 ATYP {}", atyp))),
    };

    stream
        .write_all(&[SOCKS5_VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok((Metadata::new(&target, InboundKind::Socks5), stream))
}

async fn read_until_nul(stream: &mut Stream) -> Result<String> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        if out.len() >= 255 {
            return Err(Error::Protocol("SOCKS4 field too long".into()));
        }
        out.push(byte[0]);
    }
    String::from_utf8(out).map_err(|_| Error::Protocol("non-UTF8 SOCKS4 field".into()))
}
