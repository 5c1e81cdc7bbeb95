//! Configuration loading for the MX server.
//!
//! The config file is YAML, resolved from `CONFIG_PATH`, then
//! `/config/config.yaml`, then `../config.yaml`. `domains` and
//! `database.url` are required; every other option has a default, and
//! out-of-range numeric values fall back to their defaults.

use crate::error::{MailError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub tempmail: TempmailConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub pool_size: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub mx_port: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub max_message_size_mb: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TempmailConfig {
    /// Default mailbox TTL used by the provisioning API; parsed here so one
    /// config file serves both services.
    #[serde(default)]
    pub address_lifetime_hours: i64,
    #[serde(default)]
    pub max_emails_per_address: i64,
    #[serde(default)]
    pub cleanup_interval_hours: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub check_dkim: bool,
    #[serde(default)]
    pub check_spf: bool,
    #[serde(default)]
    pub check_dmarc: bool,
    #[serde(default)]
    pub store_results: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MailError::Config(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut cfg: Config = serde_yaml::from_str(&content)
            .map_err(|e| MailError::Config(format!("failed to parse config file: {}", e)))?;

        cfg.validate()?;
        cfg.apply_defaults();
        Ok(cfg)
    }

    /// Resolve the config file location: `CONFIG_PATH`, then the deployment
    /// default, then the repo-relative fallback for local runs.
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let deployed = PathBuf::from("/config/config.yaml");
        if deployed.exists() {
            return deployed;
        }

        PathBuf::from("../config.yaml")
    }

    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(MailError::Config("database.url is required".to_string()));
        }
        if self.domains.is_empty() {
            return Err(MailError::Config(
                "at least one domain is required".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.server.mx_port <= 0 || self.server.mx_port > 65535 {
            self.server.mx_port = 25;
        }
        if self.server.hostname.is_empty() {
            self.server.hostname = "mail.tempmail.local".to_string();
        }
        if self.server.max_message_size_mb <= 0 {
            self.server.max_message_size_mb = 10;
        }
        if self.database.pool_size <= 0 {
            self.database.pool_size = 10;
        }
        if self.tempmail.max_emails_per_address <= 0 {
            self.tempmail.max_emails_per_address = 100;
        }
        if self.tempmail.address_lifetime_hours <= 0 {
            self.tempmail.address_lifetime_hours = 24;
        }
        if self.tempmail.cleanup_interval_hours < 0 {
            self.tempmail.cleanup_interval_hours = 0;
        }
        if self.tls.cert_file.is_empty() {
            self.tls.cert_file = "/config/certs/cert.pem".to_string();
        }
        if self.tls.key_file.is_empty() {
            self.tls.key_file = "/config/certs/key.pem".to_string();
        }
    }

    /// Max message size in bytes.
    pub fn max_message_size(&self) -> usize {
        self.server.max_message_size_mb as usize * 1024 * 1024
    }

    /// Accepted recipient domains, case-folded, for O(1) lookup.
    pub fn domain_set(&self) -> HashSet<String> {
        self.domains.iter().map(|d| d.to_lowercase()).collect()
    }

    /// True when at least one authentication check is switched on.
    pub fn validation_enabled(&self) -> bool {
        self.validation.check_dkim || self.validation.check_spf || self.validation.check_dmarc
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Config {
            domains: Vec::new(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            tls: TlsSettings::default(),
            tempmail: TempmailConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
        };
        cfg.apply_defaults();
        cfg
    }
}
