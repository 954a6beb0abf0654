//! Group health probes
//!
//! Each probed group gets a periodic task that issues a URL GET through
//! every child and records success and latency. Probe clocks are jittered
//! by ±interval/10 so groups sharing an interval do not fire together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{Address, InboundKind, Metadata, Stream};
use crate::dns::Resolver;
use crate::error::{Error, Result};

use super::ProxySet;

/// Per-probe timeout (5 s)
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A parsed probe URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProbeTarget {
    /// Parse `http://host[:port]/path` or `https://host[:port]/path`
    pub fn parse(url: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(Error::Config(format!("unsupported probe url: {}", url)));
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::Config(format!("probe url has no host: {}", url)));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("bad port in probe url: {}", url)))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if tls { 443 } else { 80 }),
        };

        Ok(Self {
            tls,
            host,
            port,
            path: path.to_string(),
        })
    }
}

/// Probe one outbound (or group) with a URL GET and return the latency in
/// milliseconds. The whole exchange runs under `timeout`.
pub async fn probe_once(
    set: &ProxySet,
    resolver: &Resolver,
    outbound: &str,
    url: &str,
    timeout: Duration,
) -> Result<u32> {
    let target = ProbeTarget::parse(url)?;
    let meta = Metadata::new(
        &Address::domain(target.host.clone(), target.port),
        InboundKind::Http,
    );

    let started = Instant::now();
    tokio::time::timeout(timeout, async {
        let (_, terminal) = set.resolve_chain(outbound, &meta)?;
        let mut stream = terminal.dial(&meta, resolver).await?;
        if target.tls {
            stream = wrap_tls(stream, &target.host).await?;
        }

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target.path, target.host
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        if n == 0 || !buf.starts_with(b"HTTP/") {
            return Err(Error::Protocol("probe target sent no HTTP response".into()));
        }
        Ok(())
    })
    .await
    .map_err(|_| Error::Timeout)??;

    Ok(started.elapsed().as_millis() as u32)
}

async fn wrap_tls(stream: Stream, host: &str) -> Result<Stream> {
    use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("bad TLS server name: {}", host)))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Dial(format!("TLS handshake failed: {}", e)))?;
    Ok(Box::new(tls_stream))
}

/// Spawn one prober task per probed group in the set. The returned handles
/// are aborted when the set is hot-swapped.
pub fn spawn_probers(set: Arc<ProxySet>, resolver: Arc<Resolver>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for outbound in set.groups() {
        let group = outbound.as_group().expect("groups() yields groups");
        if group.kind() == super::GroupKind::Selector {
            continue;
        }

        let name = group.name().to_string();
        let set = Arc::clone(&set);
        let resolver = Arc::clone(&resolver);

        handles.push(tokio::spawn(async move {
            loop {
                let interval = {
                    let group = set
                        .get(&name)
                        .and_then(|o| o.as_group())
                        .expect("group survives with its set");
                    group.interval()
                };
                tokio::time::sleep(jittered(interval)).await;
                probe_group(&set, &resolver, &name).await;
            }
        }));
    }

    handles
}

/// Probe every child of a group, updating alive flags and latencies
pub async fn probe_group(set: &ProxySet, resolver: &Resolver, name: &str) {
    let Some(group) = set.get(name).and_then(|o| o.as_group()) else {
        return;
    };
    let url = group.probe_url().to_string();

    for child in group.children() {
        let outcome = probe_once(set, resolver, child, &url, PROBE_TIMEOUT).await;
        match outcome {
            Ok(ms) => {
                debug!("[{}] probe {} ok in {}ms", name, child, ms);
                if let Some(outbound) = set.get(child) {
                    outbound.set_alive(true);
                }
                group.record_latency(child, Some(ms));
            }
            Err(e) => {
                debug!("[{}] probe {} failed: {}", name, child, e);
                if let Some(outbound) = set.get(child) {
                    outbound.set_alive(false);
                }
                group.record_latency(child, None);
            }
        }
    }
}

/// `interval` ± interval/10
fn jittered(interval: Duration) -> Duration {
    let base = interval.as_millis() as i64;
    let spread = base / 10;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base + offset).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{DirectOutbound, Outbound};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_http_url() {
        let target = ProbeTarget::parse("http://www.gstatic.com/generate_204").unwrap();
        assert_eq!(
            target,
            ProbeTarget {
                tls: false,
                host: "www.gstatic.com".to_string(),
                port: 80,
                path: "/generate_204".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_https_with_port() {
        let target = ProbeTarget::parse("https://probe.test:8443").unwrap();
        assert!(target.tls);
        assert_eq!(target.port, 8443);
        assert_eq!(target.path, "/");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(ProbeTarget::parse("ftp://x.test/y").is_err());
        assert!(ProbeTarget::parse("http://").is_err());
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let interval = Duration::from_secs(600);
        for _ in 0..64 {
            let j = jittered(interval);
            assert!(j >= Duration::from_secs(540));
            assert!(j <= Duration::from_secs(660));
        }
    }

    #[tokio::test]
    async fn test_probe_against_local_http_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let set = ProxySet::new(vec![Outbound::Direct(DirectOutbound::new("d"))]).unwrap();
        let resolver = Resolver::new(vec![]);
        let url = format!("http://{}/gen", addr);
        let ms = probe_once(&set, &resolver, "d", &url, PROBE_TIMEOUT)
            .await
            .unwrap();
        assert!(ms < 5000);
    }

    #[tokio::test]
    async fn test_probe_unreachable_fails() {
        let set = ProxySet::new(vec![Outbound::Direct(DirectOutbound::new("d"))]).unwrap();
        let resolver = Resolver::new(vec![]);
        // Reserved TEST-NET address, nothing listens there
        let result = probe_once(
            &set,
            &resolver,
            "d",
            "http://192.0.2.1:9/x",
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
    }
}
