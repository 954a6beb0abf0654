//! Dispatcher - per-connection resolve, match, dial, splice
//!
//! Flow: finalize metadata (fake-IP reversal, optional process lookup),
//! evaluate rules, resolve the named outbound through its groups, dial with
//! a hard deadline, then register the connection and splice. A dial failure
//! through a Fallback or URLTest group marks the chosen child dead and
//! retries exactly once against the group's next pick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::reload::SnapshotCell;
use crate::common::{relay, CancelToken, Counter, Metadata, Pipe, Stream};
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::logbus::LogBus;
use crate::metrics::{
    self, DISPATCHER_CONNECTIONS_ACTIVE, DISPATCHER_CONNECTIONS_FAILED,
    DISPATCHER_CONNECTIONS_TOTAL, OUTBOUND_DIALS_TOTAL, OUTBOUND_DIAL_FAILURES,
    RULE_MATCHES_TOTAL, TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED,
};
use crate::outbound::{Outbound, ProxySet};
use crate::rules::{RuleEngine, RuleMatch};

use super::{Mode, Tracker};

/// Hard deadline on an outbound dial (10 s)
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The name the implicit direct outbound always carries
pub const DIRECT_OUTBOUND: &str = "DIRECT";

/// Dispatcher wires an accepted connection to an outbound and runs the
/// splice for its lifetime. It reads the rule and proxy snapshots but owns
/// neither; the hot-reload coordinator swaps them underneath.
pub struct Dispatcher {
    rules: Arc<SnapshotCell<RuleEngine>>,
    proxies: Arc<SnapshotCell<ProxySet>>,
    resolver: Arc<SnapshotCell<Resolver>>,
    tracker: Arc<Tracker>,
    logbus: Arc<LogBus>,
    mode: Arc<RwLock<Mode>>,
    find_process: bool,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<SnapshotCell<RuleEngine>>,
        proxies: Arc<SnapshotCell<ProxySet>>,
        resolver: Arc<SnapshotCell<Resolver>>,
        tracker: Arc<Tracker>,
        logbus: Arc<LogBus>,
        mode: Arc<RwLock<Mode>>,
    ) -> Self {
        Self {
            rules,
            proxies,
            resolver,
            tracker,
            logbus,
            mode,
            find_process: false,
        }
    }

    pub fn with_process_lookup(mut self, enabled: bool) -> Self {
        self.find_process = enabled;
        self
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Handle one accepted connection for its whole lifetime
    pub async fn dispatch(&self, metadata: Metadata, inbound_stream: Stream) -> Result<()> {
        DISPATCHER_CONNECTIONS_TOTAL.inc();
        DISPATCHER_CONNECTIONS_ACTIVE.inc();
        let result = self.handle(metadata, inbound_stream).await;
        DISPATCHER_CONNECTIONS_ACTIVE.dec();
        if let Err(e) = &result {
            DISPATCHER_CONNECTIONS_FAILED.inc();
            self.logbus.warning(format!("dispatch failed: {}", e));
        }
        result
    }

    async fn handle(&self, mut meta: Metadata, inbound_stream: Stream) -> Result<()> {
        let resolver = self.resolver.load();
        self.finalize_metadata(&mut meta, &resolver).await;

        let decision = self.decide(&mut meta, &resolver).await?;
        RULE_MATCHES_TOTAL
            .with_label_values(&[decision.rule_kind])
            .inc();

        let proxies = self.proxies.load();
        let (chain, outbound_stream) = self
            .connect(&proxies, &decision, &meta, &resolver)
            .await?;

        let id = Uuid::new_v4();
        let up = Counter::new(self.tracker.global_up());
        let down = Counter::new(self.tracker.global_down());
        let cancel = CancelToken::new();
        self.tracker.track(
            id,
            meta.clone(),
            chain.clone(),
            decision.rule_kind.to_string(),
            decision.rule_payload.clone(),
            up.handle(),
            down.handle(),
            cancel.clone(),
        );

        let src = meta
            .src_ip
            .map(|ip| format!("{}:{}", ip, meta.src_port))
            .unwrap_or_default();
        info!(
            "[{}] {} -> {} via [{}] ({}:{})",
            meta.inbound_kind,
            src,
            meta,
            chain.join(" -> "),
            decision.rule_kind,
            decision.rule_payload
        );
        self.logbus.info(format!(
            "{} -> {} match {}({}) using {}",
            src,
            meta,
            decision.rule_kind,
            decision.rule_payload,
            chain.join("/")
        ));

        let started = Instant::now();
        let (uploaded, downloaded) =
            relay(Pipe::new(inbound_stream, cancel), outbound_stream, up, down).await;
        self.tracker.untrack(id);

        TRAFFIC_BYTES_UPLOADED.inc_by(uploaded);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(downloaded);
        info!(
            "[{}] closed {} (up {} down {} in {:?})",
            meta.inbound_kind,
            meta,
            metrics::format_bytes(uploaded),
            metrics::format_bytes(downloaded),
            started.elapsed()
        );

        Ok(())
    }

    /// Fake-IP reversal and optional process lookup
    async fn finalize_metadata(&self, meta: &mut Metadata, resolver: &Resolver) {
        if let Some(ip) = meta.dst_ip {
            if resolver.is_fake_ip(ip) {
                match resolver.reverse(ip) {
                    Some(host) => {
                        debug!("fake-ip {} restored to {}", ip, host);
                        meta.dst_host = host;
                        meta.dst_ip = None;
                    }
                    None => {
                        // Evicted mapping; keep dialing the synthetic address
                        warn!("fake-ip {} has no reverse mapping", ip);
                    }
                }
            }
        }

        if self.find_process && meta.process_name.is_none() {
            if let Some(ip) = meta.src_ip {
                meta.process_name =
                    crate::platform::find_process_name(SocketAddr::new(ip, meta.src_port)).await;
            }
        }
    }

    /// Pick the outbound name per the dispatch mode
    async fn decide(&self, meta: &mut Metadata, resolver: &Resolver) -> Result<RuleMatch> {
        let mode = *self.mode.read();
        match mode {
            Mode::Direct => Ok(RuleMatch {
                target: DIRECT_OUTBOUND.to_string(),
                rule_kind: "Mode",
                rule_payload: "direct".to_string(),
            }),
            Mode::Global => Ok(RuleMatch {
                target: self.global_target(),
                rule_kind: "Mode",
                rule_payload: "global".to_string(),
            }),
            Mode::Rule => self
                .rules
                .load()
                .decide(meta, resolver)
                .await
                .ok_or_else(|| Error::Config(format!("no rule matched {}", meta))),
        }
    }

    /// Global mode target: the first configured group, else the first
    /// configured outbound, else DIRECT
    fn global_target(&self) -> String {
        let proxies = self.proxies.load();
        if let Some(group) = proxies.groups().next() {
            return group.name().to_string();
        }
        proxies
            .names()
            .iter()
            .find(|n| n.as_str() != DIRECT_OUTBOUND && n.as_str() != "REJECT")
            .cloned()
            .unwrap_or_else(|| DIRECT_OUTBOUND.to_string())
    }

    /// Resolve the decision to a terminal adapter and dial it, retrying
    /// once through Fallback/URLTest groups
    async fn connect(
        &self,
        proxies: &ProxySet,
        decision: &RuleMatch,
        meta: &Metadata,
        resolver: &Resolver,
    ) -> Result<(Vec<String>, Stream)> {
        let (chain, terminal) = proxies.resolve_chain(&decision.target, meta)?;

        match self.dial_with_deadline(&terminal, meta, resolver).await {
            Ok(stream) => Ok((chain, stream)),
            Err(e) => {
                let Some(group) = proxies.get(&decision.target).and_then(|o| o.as_group())
                else {
                    return Err(e);
                };
                if !group.kind().retries_on_failure() {
                    return Err(e);
                }

                // Mark the failed pick dead so the group moves on
                if let Some(child) = chain.get(1) {
                    if let Some(outbound) = proxies.get(child) {
                        outbound.set_alive(false);
                    }
                    group.record_latency(child, None);
                }
                if let Some(last) = chain.last() {
                    if let Some(outbound) = proxies.get(last) {
                        outbound.set_alive(false);
                    }
                }

                let (retry_chain, retry_terminal) =
                    proxies.resolve_chain(&decision.target, meta)?;
                if retry_chain == chain {
                    return Err(e);
                }
                debug!(
                    "[{}] retrying via [{}]",
                    decision.target,
                    retry_chain.join(" -> ")
                );
                let stream = self
                    .dial_with_deadline(&retry_terminal, meta, resolver)
                    .await?;
                Ok((retry_chain, stream))
            }
        }
    }

    async fn dial_with_deadline(
        &self,
        outbound: &Arc<Outbound>,
        meta: &Metadata,
        resolver: &Resolver,
    ) -> Result<Stream> {
        OUTBOUND_DIALS_TOTAL
            .with_label_values(&[outbound.name()])
            .inc();
        let result = tokio::time::timeout(DIAL_TIMEOUT, outbound.dial(meta, resolver))
            .await
            .map_err(|_| Error::Timeout)
            .and_then(|r| r);
        if result.is_err() {
            OUTBOUND_DIAL_FAILURES
                .with_label_values(&[outbound.name()])
                .inc();
        }
        result
    }
}
