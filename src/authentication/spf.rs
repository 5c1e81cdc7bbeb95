//! Simplified SPF evaluation.
//!
//! Deliberately not a full RFC 7208 evaluator: `include:`, `mx`, `redirect=`
//! and macro expansion are not handled, and `a` matches without performing
//! the A lookup. The output set is the full RFC 7208 result set so a
//! complete evaluator can drop in later.

use super::types::SpfStatus;
use crate::utils::sender_domain;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub struct SpfEvaluator {
    resolver: TokioAsyncResolver,
}

impl SpfEvaluator {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    /// Evaluate SPF for one delivery attempt.
    ///
    /// A sender without a domain, an unparseable client IP, or a domain
    /// without a usable `v=spf1` record all yield `None` rather than an
    /// error: SPF problems never block reception.
    pub async fn check(&self, client_ip: &str, envelope_from: &str) -> SpfStatus {
        let domain = sender_domain(envelope_from);
        if domain.is_empty() {
            return SpfStatus::None;
        }

        let ip: IpAddr = match client_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                debug!("SPF: unparseable client IP {}", client_ip);
                return SpfStatus::None;
            }
        };

        let record = match self.lookup_record(&domain).await {
            Some(record) => record,
            None => {
                debug!("SPF: no record for {}", domain);
                return SpfStatus::None;
            }
        };

        let status = evaluate_record(&record, ip);
        debug!("SPF: {} (domain={}, ip={})", status, domain, ip);
        status
    }

    /// Find the `v=spf1` TXT record for a domain, if any.
    async fn lookup_record(&self, domain: &str) -> Option<String> {
        let lookup = self.resolver.txt_lookup(domain).await.ok()?;

        for record in lookup.iter() {
            let text = record.to_string();
            if text.starts_with("v=spf1") {
                return Some(text);
            }
        }

        None
    }
}

impl Default for SpfEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a `v=spf1` record against a client IP, left to right, stopping
/// at the first matching mechanism.
pub fn evaluate_record(record: &str, ip: IpAddr) -> SpfStatus {
    for mechanism in record.split_whitespace().skip(1) {
        if let Some(spec) = mechanism
            .strip_prefix("ip4:")
            .or_else(|| mechanism.strip_prefix("ip6:"))
        {
            if ip_matches(ip, spec) {
                return SpfStatus::Pass;
            }
        } else if mechanism == "a" || mechanism == "+a" {
            // The A lookup is not performed in this evaluator.
            return SpfStatus::Neutral;
        } else if mechanism == "-all" {
            return SpfStatus::Fail;
        } else if mechanism == "~all" {
            return SpfStatus::SoftFail;
        } else if mechanism == "?all" {
            return SpfStatus::Neutral;
        }
    }

    SpfStatus::Neutral
}

/// Match an IP against an exact address or a CIDR range.
fn ip_matches(ip: IpAddr, spec: &str) -> bool {
    if spec.contains('/') {
        match spec.parse::<IpNet>() {
            Ok(net) => net.contains(&ip),
            Err(_) => false,
        }
    } else {
        match spec.parse::<IpAddr>() {
            Ok(addr) => addr == ip,
            Err(_) => false,
        }
    }
}
