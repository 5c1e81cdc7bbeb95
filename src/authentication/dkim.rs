//! DKIM signature verification for incoming mail.

use mail_auth::{AuthenticatedMessage, DkimResult, Resolver};
use tracing::{debug, warn};

/// Verifies every `DKIM-Signature` header on a message.
pub struct DkimVerifier {
    resolver: Resolver,
}

impl DkimVerifier {
    pub fn new() -> Self {
        let resolver = Resolver::new_system_conf().unwrap_or_else(|_| {
            warn!("Failed to load system DNS config, using default resolver");
            Resolver::new_cloudflare_tls().expect("Failed to create DNS resolver")
        });

        Self { resolver }
    }

    /// True when at least one signature verifies. Messages without
    /// signatures, with only broken signatures, or that cannot be parsed
    /// at all verify as false.
    pub async fn verify(&self, raw_message: &[u8]) -> bool {
        let message = match AuthenticatedMessage::parse(raw_message) {
            Some(message) => message,
            None => {
                debug!("DKIM: message not parseable, treating as unsigned");
                return false;
            }
        };

        let outputs = self.resolver.verify_dkim(&message).await;
        if outputs.is_empty() {
            debug!("DKIM: no signatures present");
            return false;
        }

        for (i, output) in outputs.iter().enumerate() {
            match output.result() {
                DkimResult::Pass => {
                    debug!("DKIM: signature {} valid", i + 1);
                    return true;
                }
                other => {
                    debug!("DKIM: signature {} did not verify: {:?}", i + 1, other);
                }
            }
        }

        false
    }
}

impl Default for DkimVerifier {
    fn default() -> Self {
        Self::new()
    }
}
