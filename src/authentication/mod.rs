//! Sender authentication: DKIM verification, simplified SPF evaluation and
//! a derived DMARC verdict.
//!
//! Verdicts are recorded on the stored message for downstream consumers;
//! they are never used to reject mail at receive time. Any DNS or
//! verification failure degrades to a neutral outcome instead of failing
//! the delivery.

pub mod dkim;
pub mod dmarc;
pub mod spf;
pub mod types;

pub use types::{AuthResult, DkimVerdict, DmarcStatus, SpfStatus};

use crate::config::ValidationConfig;
use crate::utils::sender_domain;
use dkim::DkimVerifier;
use dmarc::DmarcEvaluator;
use spf::SpfEvaluator;
use tracing::info;

/// Runs the configured authentication checks on a received message.
pub struct Authenticator {
    check_dkim: bool,
    check_spf: bool,
    check_dmarc: bool,
    dkim: DkimVerifier,
    spf: SpfEvaluator,
    dmarc: DmarcEvaluator,
}

impl Authenticator {
    pub fn new(validation: &ValidationConfig) -> Self {
        Self {
            check_dkim: validation.check_dkim,
            check_spf: validation.check_spf,
            check_dmarc: validation.check_dmarc,
            dkim: DkimVerifier::new(),
            spf: SpfEvaluator::new(),
            dmarc: DmarcEvaluator::new(),
        }
    }

    /// Run the enabled checks against a message.
    ///
    /// `helo_name` is the peer's EHLO/HELO argument; it is recorded in the
    /// logs but takes no part in the simplified evaluation.
    pub async fn authenticate(
        &self,
        raw_message: &[u8],
        envelope_from: &str,
        client_ip: &str,
        helo_name: &str,
    ) -> AuthResult {
        let mut result = AuthResult::default();

        if self.check_dkim {
            result.dkim = DkimVerdict::Checked(self.dkim.verify(raw_message).await);
        }

        if self.check_spf {
            result.spf = self.spf.check(client_ip, envelope_from).await;
        }

        if self.check_dmarc {
            let from_domain = sender_domain(envelope_from);
            result.dmarc = self.dmarc.check(&from_domain, result.spf, result.dkim).await;
        }

        info!(
            "Authentication for <{}> (ip={}, helo={}): dkim={}, spf={}, dmarc={}",
            envelope_from, client_ip, helo_name, result.dkim, result.spf, result.dmarc
        );

        result
    }
}
