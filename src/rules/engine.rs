//! First-match rule evaluation
//!
//! Evaluation is strict first-match over the ordered list. A rule that
//! needs an IP triggers one resolution of the destination host; if that
//! fails, every IP rule is skipped and evaluation continues.

use std::sync::Arc;

use tracing::debug;

use crate::common::Metadata;
use crate::dns::Resolver;
use crate::geoip::GeoIpMatcher;

use super::Rule;

/// The decision produced by a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub target: String,
    pub rule_kind: &'static str,
    pub rule_payload: String,
}

/// Ordered rule set with first-match evaluation
pub struct RuleEngine {
    rules: Vec<Rule>,
    geoip: Arc<GeoIpMatcher>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, geoip: Arc<GeoIpMatcher>) -> Self {
        Self { rules, geoip }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate the ordered rule list against the metadata.
    ///
    /// Resolution happens at most once, lazily, when the first IP-needing
    /// rule is reached on a host-only destination. On success `meta.dst_ip`
    /// is populated for the rest of the evaluation (and for the dial).
    pub async fn decide(&self, meta: &mut Metadata, resolver: &Resolver) -> Option<RuleMatch> {
        let mut resolution_failed = false;

        for rule in &self.rules {
            if rule.requires_ip() && meta.dst_ip.is_none() && meta.has_host() {
                if resolution_failed {
                    continue;
                }
                match resolver.resolve_ip(&meta.dst_host).await {
                    Ok(ip) => meta.dst_ip = Some(ip),
                    Err(e) => {
                        debug!("resolve {} failed, skipping IP rules: {}", meta.dst_host, e);
                        resolution_failed = true;
                        continue;
                    }
                }
            }

            if rule.matches(meta, &self.geoip) {
                return Some(RuleMatch {
                    target: rule.target().to_string(),
                    rule_kind: rule.kind().name(),
                    rule_payload: rule.payload().to_string(),
                });
            }
        }

        None
    }
}
