//! Schema bootstrap for the mail store.
//!
//! The statements are idempotent; the invariants the SMTP tier relies on
//! (orphaned messages vanish with their last recipient link, already-expired
//! mailboxes cannot be inserted) live in the schema itself so that every
//! writer observes them.

pub(super) const SCHEMA: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS pg_trgm",
    r#"
    CREATE TABLE IF NOT EXISTS addresses (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        email VARCHAR(255) NOT NULL UNIQUE CHECK (email ~ '^[^@]+@[^@]+$'),
        token VARCHAR(64) NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        CHECK (expires_at > created_at)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_addresses_expires_at ON addresses (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS emails (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        message_id VARCHAR(255),
        subject TEXT,
        from_address VARCHAR(255) NOT NULL,
        to_address VARCHAR(255) NOT NULL,
        raw_headers TEXT NOT NULL,
        body_plain TEXT,
        body_html TEXT,
        raw_message BYTEA NOT NULL,
        size_bytes BIGINT NOT NULL DEFAULT 0 CHECK (size_bytes >= 0),
        dkim_valid BOOLEAN,
        spf_result VARCHAR(20),
        dmarc_result VARCHAR(20),
        has_attachments BOOLEAN NOT NULL DEFAULT FALSE,
        received_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails (message_id)",
    "CREATE INDEX IF NOT EXISTS idx_emails_from_address ON emails (from_address)",
    "CREATE INDEX IF NOT EXISTS idx_emails_to_address ON emails (to_address)",
    "CREATE INDEX IF NOT EXISTS idx_emails_received_at ON emails (received_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_emails_subject_trgm ON emails USING gin (subject gin_trgm_ops)",
    r#"
    CREATE TABLE IF NOT EXISTS email_recipients (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        email_id UUID NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        address_id UUID NOT NULL REFERENCES addresses(id) ON DELETE CASCADE,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        read_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (email_id, address_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_email_recipients_email_id ON email_recipients (email_id)",
    "CREATE INDEX IF NOT EXISTS idx_email_recipients_address_id ON email_recipients (address_id)",
    "CREATE INDEX IF NOT EXISTS idx_email_recipients_is_read ON email_recipients (is_read)",
    r#"
    CREATE TABLE IF NOT EXISTS attachments (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        email_id UUID NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        filename VARCHAR(255) NOT NULL,
        content_type VARCHAR(127) NOT NULL,
        size_bytes BIGINT NOT NULL CHECK (size_bytes >= 0),
        data BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_attachments_email_id ON attachments (email_id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_filename ON attachments (filename)",
    // A message with no remaining recipient links is unreachable by the
    // API and must disappear together with its attachments.
    r#"
    CREATE OR REPLACE FUNCTION delete_orphaned_email() RETURNS trigger AS $$
    BEGIN
        IF NOT EXISTS (
            SELECT 1 FROM email_recipients WHERE email_id = OLD.email_id
        ) THEN
            DELETE FROM emails WHERE id = OLD.email_id;
        END IF;
        RETURN OLD;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS trg_email_recipients_orphan ON email_recipients",
    r#"
    CREATE TRIGGER trg_email_recipients_orphan
        AFTER DELETE ON email_recipients
        FOR EACH ROW
        EXECUTE FUNCTION delete_orphaned_email()
    "#,
    r#"
    CREATE OR REPLACE FUNCTION reject_expired_address() RETURNS trigger AS $$
    BEGIN
        IF NEW.expires_at <= now() THEN
            RAISE EXCEPTION 'address % is already expired', NEW.email;
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS trg_addresses_reject_expired ON addresses",
    r#"
    CREATE TRIGGER trg_addresses_reject_expired
        BEFORE INSERT ON addresses
        FOR EACH ROW
        EXECUTE FUNCTION reject_expired_address()
    "#,
    r#"
    CREATE OR REPLACE FUNCTION cleanup_expired_addresses() RETURNS integer AS $$
    DECLARE
        deleted integer;
    BEGIN
        DELETE FROM addresses WHERE expires_at < now();
        GET DIAGNOSTICS deleted = ROW_COUNT;
        RETURN deleted;
    END;
    $$ LANGUAGE plpgsql
    "#,
];
