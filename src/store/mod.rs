//! Transactional persistence of received mail.
//!
//! One message is stored per accepted recipient: the `emails` row, its
//! `email_recipients` link and its `attachments` rows commit or roll back
//! together. Mailboxes (`addresses`) are provisioned by the external API;
//! the MX only looks them up and refuses recipients it cannot resolve.

mod schema;

use crate::authentication::{DkimVerdict, DmarcStatus, SpfStatus};
use crate::error::{MailError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection lifetime cap, to defeat stale pooled connections.
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// One received message, ready for persistence.
#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub message_id: Option<String>,
    pub subject: String,
    pub from_address: String,
    pub to_address: String,
    pub raw_headers: String,
    pub body_plain: String,
    pub body_html: String,
    pub raw_message: Vec<u8>,
    pub size_bytes: i64,
    pub dkim_valid: DkimVerdict,
    pub spf_result: Option<SpfStatus>,
    pub dmarc_result: Option<DmarcStatus>,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
}

/// One decoded attachment belonging to a message.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub data: Vec<u8>,
}

/// The store operations the SMTP session depends on.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Case-insensitive mailbox existence check. Fails only on
    /// connectivity errors.
    async fn address_exists(&self, email: &str) -> Result<bool>;

    /// Atomically persist one message, its recipient link and its
    /// attachments.
    async fn store_email(
        &self,
        email: &EmailRecord,
        attachments: &[AttachmentRecord],
    ) -> Result<()>;
}

/// PostgreSQL-backed mail store.
#[derive(Clone)]
pub struct PgMailStore {
    pool: PgPool,
    max_emails_per_address: i64,
}

impl PgMailStore {
    pub fn new(pool: PgPool, max_emails_per_address: i64) -> Self {
        Self {
            pool,
            max_emails_per_address,
        }
    }

    /// Open a bounded connection pool: `pool_size` connections at most,
    /// half of them kept idle.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .min_connections(pool_size / 2)
            .max_lifetime(CONN_MAX_LIFETIME)
            .connect(database_url)
            .await?;

        Ok(pool)
    }

    /// Apply the idempotent schema (tables, indexes, triggers, cleanup
    /// function).
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Mail store schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Keep at most `cap` messages for one mailbox, deleting the oldest
    /// excess. Invoked asynchronously after each successful store.
    pub async fn enforce_limit(&self, address_id: Uuid, cap: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM emails
            WHERE id IN (
                SELECT e.id
                FROM emails e
                JOIN email_recipients er ON er.email_id = e.id
                WHERE er.address_id = $1
                ORDER BY e.received_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(address_id)
        .bind(cap)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                "Deleted {} old emails for address {} (limit {})",
                deleted, address_id, cap
            );
        }

        Ok(deleted)
    }

    /// Delete every expired mailbox; cascades and the orphan trigger take
    /// care of dependent rows. Returns the number of mailboxes removed.
    pub async fn sweep_expired(&self) -> Result<i64> {
        let deleted: i32 = sqlx::query_scalar("SELECT cleanup_expired_addresses()")
            .fetch_one(&self.pool)
            .await?;

        if deleted > 0 {
            info!("Expiry sweep removed {} addresses", deleted);
        }

        Ok(deleted as i64)
    }
}

#[async_trait]
impl MailStore for PgMailStore {
    async fn address_exists(&self, email: &str) -> Result<bool> {
        let normalized = email.to_lowercase();

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM addresses WHERE email = $1)")
                .bind(&normalized)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn store_email(
        &self,
        email: &EmailRecord,
        attachments: &[AttachmentRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let email_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO emails (
                message_id, subject, from_address, to_address, raw_headers,
                body_plain, body_html, raw_message, size_bytes,
                dkim_valid, spf_result, dmarc_result, has_attachments, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(&email.message_id)
        .bind(&email.subject)
        .bind(&email.from_address)
        .bind(&email.to_address)
        .bind(&email.raw_headers)
        .bind(&email.body_plain)
        .bind(&email.body_html)
        .bind(&email.raw_message)
        .bind(email.size_bytes)
        .bind(email.dkim_valid.as_db())
        .bind(email.spf_result.map(|s| s.as_str()))
        .bind(email.dmarc_result.map(|s| s.as_str()))
        .bind(email.has_attachments)
        .bind(email.received_at)
        .fetch_one(&mut *tx)
        .await?;

        // The mailbox must already exist; this MX never auto-creates one.
        let normalized = email.to_address.to_lowercase();
        let address_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM addresses WHERE email = $1")
            .bind(&normalized)
            .fetch_optional(&mut *tx)
            .await?;

        let address_id = address_id.ok_or_else(|| {
            MailError::Storage(format!("address does not exist: {}", normalized))
        })?;

        sqlx::query("INSERT INTO email_recipients (email_id, address_id) VALUES ($1, $2)")
            .bind(email_id)
            .bind(address_id)
            .execute(&mut *tx)
            .await?;

        for attachment in attachments {
            sqlx::query(
                r#"
                INSERT INTO attachments (email_id, filename, content_type, size_bytes, data)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(email_id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size_bytes)
            .bind(&attachment.data)
            .execute(&mut *tx)
            .await?;

            debug!(
                "Stored attachment {} ({} bytes)",
                attachment.filename, attachment.size_bytes
            );
        }

        tx.commit().await?;

        info!(
            "Stored email {} for {} ({} bytes, {} attachments)",
            email.message_id.as_deref().unwrap_or("<no message-id>"),
            normalized,
            email.size_bytes,
            attachments.len()
        );

        // Quota enforcement runs off the hot path; a failure here must not
        // fail the SMTP transaction.
        let store = self.clone();
        let cap = self.max_emails_per_address;
        tokio::spawn(async move {
            if let Err(e) = store.enforce_limit(address_id, cap).await {
                warn!(
                    "Failed to enforce email limit for address {}: {}",
                    address_id, e
                );
            }
        });

        Ok(())
    }
}
