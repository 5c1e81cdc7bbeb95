//! Derived DMARC verdict.
//!
//! The policy record is looked up but not parsed beyond its presence: the
//! verdict is `pass` when SPF passed or a DKIM signature verified, `fail`
//! otherwise, and `none` when no policy is published. Aggregate reporting
//! (rua/ruf) is out of scope.

use super::types::{DkimVerdict, DmarcStatus, SpfStatus};
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub struct DmarcEvaluator {
    resolver: TokioAsyncResolver,
}

impl DmarcEvaluator {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    /// Derive the DMARC verdict for a sender domain from the SPF and DKIM
    /// outcomes.
    pub async fn check(&self, from_domain: &str, spf: SpfStatus, dkim: DkimVerdict) -> DmarcStatus {
        if from_domain.is_empty() {
            return DmarcStatus::None;
        }

        let record = match self.lookup_policy(from_domain).await {
            Some(record) => record,
            None => {
                debug!("DMARC: no policy for {}", from_domain);
                return DmarcStatus::None;
            }
        };

        let verdict = derive_verdict(spf, dkim);
        debug!(
            "DMARC: {} (policy={}, spf={}, dkim={})",
            verdict, record, spf, dkim
        );
        verdict
    }

    /// Look up the `v=DMARC1` TXT record at `_dmarc.<domain>`, falling back
    /// to the organizational domain when the exact domain publishes none.
    async fn lookup_policy(&self, domain: &str) -> Option<String> {
        if let Some(record) = self.lookup_txt(domain).await {
            return Some(record);
        }

        let org = organizational_domain(domain)?;
        if org == domain {
            return None;
        }
        self.lookup_txt(&org).await
    }

    async fn lookup_txt(&self, domain: &str) -> Option<String> {
        let name = format!("_dmarc.{}", domain);
        let lookup = self.resolver.txt_lookup(name).await.ok()?;

        for record in lookup.iter() {
            let text = record.to_string();
            if text.starts_with("v=DMARC1") {
                return Some(text);
            }
        }

        None
    }
}

impl Default for DmarcEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// A published policy passes when either aligned mechanism does.
fn derive_verdict(spf: SpfStatus, dkim: DkimVerdict) -> DmarcStatus {
    if spf == SpfStatus::Pass || dkim.passed() {
        DmarcStatus::Pass
    } else {
        DmarcStatus::Fail
    }
}

/// Reduce an FQDN to its registrable (organizational) domain using the
/// Public Suffix List. Single-label names and bare suffixes have no
/// registrable domain.
pub fn organizational_domain(domain: &str) -> Option<String> {
    if domain.is_empty() {
        return None;
    }

    let domain = domain.to_lowercase();
    psl::domain_str(&domain).map(|d| d.to_string())
}
