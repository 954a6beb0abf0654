//! Upstream nameserver clients
//!
//! Plain UDP (RFC 1035) queries via hickory-proto. Each query opens an
//! ephemeral socket, validates the response id, and extracts the address
//! records plus the minimum TTL.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Error, Result};

use super::QueryType;

/// Response buffer size; large enough for EDNS0 payloads
const RECV_BUFFER_SIZE: usize = 4096;

/// Default per-query timeout
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved answer: the address records and the minimum record TTL
#[derive(Debug, Clone)]
pub struct Answer {
    pub ips: Vec<IpAddr>,
    pub min_ttl: u32,
}

/// Upstream nameserver seam; tests swap in scripted implementations
#[async_trait]
pub trait DnsUpstream: Send + Sync {
    async fn query(&self, host: &str, qtype: QueryType) -> Result<Answer>;

    fn name(&self) -> &str;
}

/// UDP nameserver client
pub struct UdpUpstream {
    name: String,
    server: SocketAddr,
    timeout: Duration,
}

impl UdpUpstream {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            name: server.to_string(),
            server,
            timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_query(host: &str, qtype: QueryType) -> Result<(Message, u16)> {
        let name = Name::from_utf8(host)
            .map_err(|e| Error::Resolve(format!("invalid name {}: {}", host, e)))?;
        let record_type = match qtype {
            QueryType::A => RecordType::A,
            QueryType::Aaaa => RecordType::AAAA,
        };

        let id: u16 = rand::random();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, record_type));
        Ok((message, id))
    }

    fn parse_answer(response: &Message) -> Result<Answer> {
        if response.response_code() != ResponseCode::NoError {
            return Err(Error::Resolve(format!(
                "upstream returned {}",
                response.response_code()
            )));
        }

        let mut ips = Vec::new();
        let mut min_ttl = u32::MAX;
        for record in response.answers() {
            let ip = match record.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(a)) => IpAddr::V6(a.0),
                _ => continue,
            };
            ips.push(ip);
            min_ttl = min_ttl.min(record.ttl());
        }

        if ips.is_empty() {
            return Err(Error::Resolve("empty answer".into()));
        }
        Ok(Answer {
            ips,
            min_ttl: if min_ttl == u32::MAX { 0 } else { min_ttl },
        })
    }
}

#[async_trait]
impl DnsUpstream for UdpUpstream {
    async fn query(&self, host: &str, qtype: QueryType) -> Result<Answer> {
        let (message, id) = Self::build_query(host, qtype)?;
        let packet = message
            .to_vec()
            .map_err(|e| Error::Resolve(format!("encode query: {}", e)))?;

        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid bind address")
        } else {
            "[::]:0".parse().expect("valid bind address")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&packet, self.server).await?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            if from != self.server {
                continue;
            }
            let response = match Message::from_vec(&buf[..len]) {
                Ok(m) => m,
                Err(_) => continue,
            };
            // Mismatched id: a stale response to an earlier query
            if response.id() != id {
                continue;
            }
            return Self::parse_answer(&response);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_sets_recursion() {
        let (message, id) = UdpUpstream::build_query("example.com", QueryType::A).unwrap();
        assert_eq!(message.id(), id);
        assert!(message.recursion_desired());
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
    }

    #[test]
    fn test_build_query_rejects_garbage() {
        assert!(UdpUpstream::build_query("exa mple..com..", QueryType::A).is_err());
    }

    #[test]
    fn test_parse_answer_rejects_nxdomain() {
        let mut response = Message::new();
        response.set_response_code(ResponseCode::NXDomain);
        assert!(UdpUpstream::parse_answer(&response).is_err());
    }

    #[test]
    fn test_parse_answer_collects_min_ttl() {
        use hickory_proto::rr::rdata::A;
        use hickory_proto::rr::Record;

        let name = Name::from_utf8("example.com").unwrap();
        let mut response = Message::new();
        response.add_answer(Record::from_rdata(
            name.clone(),
            120,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));
        response.add_answer(Record::from_rdata(
            name,
            60,
            RData::A(A("5.6.7.8".parse().unwrap())),
        ));

        let answer = UdpUpstream::parse_answer(&response).unwrap();
        assert_eq!(answer.ips.len(), 2);
        assert_eq!(answer.min_ttl, 60);
    }
}
