//! TCP accept loop for the MX.

use crate::authentication::Authenticator;
use crate::config::Config;
use crate::error::Result;
use crate::security::TlsConfig;
use crate::smtp::session::SmtpSession;
use crate::store::MailStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long in-flight sessions may keep running after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything a session needs, shared immutably across connections.
pub struct Backend {
    pub hostname: String,
    pub domains: HashSet<String>,
    pub max_message_size: usize,
    pub store: Arc<dyn MailStore>,
    pub authenticator: Option<Authenticator>,
    pub tls: Option<TlsConfig>,
}

pub struct SmtpServer {
    backend: Arc<Backend>,
    port: u16,
}

impl SmtpServer {
    /// Wire the backend together from config. Fails on unusable TLS
    /// material, which is a startup error.
    pub fn new(config: &Config, store: Arc<dyn MailStore>) -> Result<Self> {
        let authenticator = if config.validation_enabled() {
            info!(
                "Email validation enabled - DKIM: {}, SPF: {}, DMARC: {}",
                config.validation.check_dkim,
                config.validation.check_spf,
                config.validation.check_dmarc
            );
            Some(Authenticator::new(&config.validation))
        } else {
            info!("Email validation disabled");
            None
        };

        let tls = if config.tls.enabled {
            let tls = TlsConfig::from_pem_files(&config.tls.cert_file, &config.tls.key_file)?;
            info!("TLS/STARTTLS enabled (cert: {})", config.tls.cert_file);
            Some(tls)
        } else {
            warn!("TLS/STARTTLS disabled - connections will be unencrypted");
            None
        };

        let backend = Backend {
            hostname: config.server.hostname.clone(),
            domains: config.domain_set(),
            max_message_size: config.max_message_size(),
            store,
            authenticator,
            tls,
        };

        Ok(Self {
            backend: Arc::new(backend),
            port: config.server.mx_port as u16,
        })
    }

    /// Bind the configured port and serve until shutdown is signalled.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("SMTP server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener. Kept separate so tests can bind
    /// an ephemeral port.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            info!("New SMTP connection from {}", peer);
                            let backend = self.backend.clone();
                            sessions.spawn(async move {
                                let session = SmtpSession::new(backend, peer);
                                if let Err(e) = session.handle(socket).await {
                                    // Peer-level transport errors end the
                                    // session without a reply.
                                    warn!("[{}] Session ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished sessions so the set stays bounded.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.changed() => {
                    info!("Shutdown signalled, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        if !sessions.is_empty() {
            info!(
                "Waiting up to {:?} for {} in-flight session(s)",
                SHUTDOWN_GRACE,
                sessions.len()
            );

            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!("Grace period elapsed, aborting remaining sessions");
                sessions.shutdown().await;
            }
        }

        info!("SMTP server stopped");
        Ok(())
    }
}
