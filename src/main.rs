use std::sync::Arc;
use std::time::Duration;
use tempmail_mx::config::Config;
use tempmail_mx::smtp::SmtpServer;
use tempmail_mx::store::PgMailStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = Config::resolve_path();
    let config = Config::from_file(&config_path)?;

    init_tracing(&config.logging.level);

    info!("Tempmail MX server starting");
    info!("Configuration loaded from {}", config_path.display());
    info!("  Domains: {:?}", config.domains);
    info!("  MX port: {}", config.server.mx_port);
    info!("  Hostname: {}", config.server.hostname);
    info!("  Max message size: {} MB", config.server.max_message_size_mb);
    info!(
        "  Validation - DKIM: {}, SPF: {}, DMARC: {}",
        config.validation.check_dkim, config.validation.check_spf, config.validation.check_dmarc
    );

    // Connect to the mail store; an unreachable database is fatal.
    let pool = PgMailStore::connect(&config.database.url, config.database.pool_size as u32).await?;
    let store = PgMailStore::new(pool, config.tempmail.max_emails_per_address);
    store.ensure_schema().await?;
    info!("Database connection established");

    // Periodic expiry sweep; dependent rows go with the mailboxes.
    if config.tempmail.cleanup_interval_hours > 0 {
        let sweeper = store.clone();
        let interval = Duration::from_secs(config.tempmail.cleanup_interval_hours as u64 * 3600);
        info!(
            "Expiry sweep every {}h",
            config.tempmail.cleanup_interval_hours
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep_expired().await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
        });
    }

    let server = SmtpServer::new(&config, Arc::new(store))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    info!("Tempmail MX server is ready to receive emails");

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }

    let _ = shutdown_tx.send(true);
    server_task.await??;

    info!("Tempmail MX server stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
