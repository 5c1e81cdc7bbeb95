//! tempmail-mx: inbound-only SMTP MX for a disposable-email service
//!
//! Receives mail for a pre-registered set of mailboxes on configured
//! domains, authenticates the sender (DKIM, SPF, DMARC), decodes the MIME
//! content and persists the message, its structure and its attachments
//! into PostgreSQL for the sibling HTTP API to serve.
//!
//! # Features
//!
//! - **SMTP receiving**: RFC 5321 subset with SIZE, 8BITMIME and STARTTLS
//! - **Recipient policy**: domain whitelist plus mailbox existence check
//! - **Authentication**: DKIM verification, simplified SPF, derived DMARC;
//!   verdicts are recorded, never enforced
//! - **Storage**: transactional persistence with background quota
//!   enforcement and periodic mailbox expiry
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP protocol implementation
//! - [`mime`]: MIME decoding of received messages
//! - [`authentication`]: Sender authentication checks
//! - [`store`]: PostgreSQL mail store
//! - [`security`]: TLS material for STARTTLS

pub mod authentication;
pub mod config;
pub mod error;
pub mod mime;
pub mod security;
pub mod smtp;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
