//! One SMTP session with a single peer.
//!
//! The session is a state machine over the RFC 5321 verb order. Recipient
//! policy is enforced at RCPT time (domain whitelist + mailbox existence);
//! DATA drives the extract → authenticate → store pipeline. Authentication
//! verdicts are recorded, never used to refuse mail.

use crate::error::{MailError, Result};
use crate::mime::MimeParser;
use crate::smtp::commands::SmtpCommand;
use crate::smtp::server::Backend;
use crate::store::{AttachmentRecord, EmailRecord};
use crate::utils::{parse_address, split_address};
use chrono::Utc;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Recipient cap per transaction.
const MAX_RECIPIENTS: usize = 50;

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Per-command read timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-read timeout inside DATA.
const DATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Plain body stored when a message carries no text at all.
const EMPTY_BODY_PLACEHOLDER: &str = "[no content]";

/// Unified stream type for plain and TLS connections, enabling STARTTLS
/// upgrades mid-session.
enum SmtpStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Temporary state during STARTTLS upgrade - should never be observable
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => {
                panic!("Attempted I/O on SmtpStream during STARTTLS upgrade")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// Result of processing a batch of commands on one stream.
enum SessionResult {
    /// Restart command processing (after a STARTTLS upgrade).
    Continue,
    Quit,
}

pub struct SmtpSession {
    backend: Arc<Backend>,
    remote_addr: SocketAddr,
    state: SmtpState,
    helo_name: String,
    from: Option<String>,
    to: Vec<String>,
    data: Vec<u8>,
    is_encrypted: bool,
    error_count: usize,
}

impl SmtpSession {
    pub fn new(backend: Arc<Backend>, remote_addr: SocketAddr) -> Self {
        Self {
            backend,
            remote_addr,
            state: SmtpState::Fresh,
            helo_name: String::new(),
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            is_encrypted: false,
            error_count: 0,
        }
    }

    /// Drive the whole session on one accepted connection.
    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        let mut smtp_stream = SmtpStream::Plain(stream);

        smtp_stream
            .write_all(
                format!("220 {} ESMTP Service Ready\r\n", self.backend.hostname).as_bytes(),
            )
            .await?;

        loop {
            match self.process_commands(&mut smtp_stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        // When STARTTLS happens the reader must be dropped to regain the
        // stream; the reborrow keeps that possible.
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut line = String::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!("[{}] Too many errors, disconnecting", self.remote_addr);
                buf_reader
                    .write_all(b"421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(SessionResult::Quit);
            }

            line.clear();

            let read_result = timeout(COMMAND_TIMEOUT, buf_reader.read_line(&mut line)).await;

            let n = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("[{}] IO error reading command: {}", self.remote_addr, e);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("[{}] Command timeout, disconnecting", self.remote_addr);
                    buf_reader
                        .write_all(b"421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(SessionResult::Quit);
                }
            };

            if n == 0 {
                debug!("[{}] Client disconnected", self.remote_addr);
                return Ok(SessionResult::Quit);
            }

            if line.len() > MAX_LINE_LENGTH {
                buf_reader.write_all(b"500 Line too long\r\n").await?;
                self.error_count += 1;
                continue;
            }

            let line_trimmed = line.trim_end();
            debug!("[{}] C: {}", self.remote_addr, line_trimmed);

            match SmtpCommand::parse(line_trimmed) {
                Ok(SmtpCommand::Starttls) => {
                    drop(buf_reader);

                    match self.handle_starttls_upgrade(stream).await {
                        Ok(true) => {
                            info!("[{}] STARTTLS upgrade completed", self.remote_addr);
                            return Ok(SessionResult::Continue);
                        }
                        Ok(false) => {
                            buf_reader = BufReader::new(&mut *stream);
                            continue;
                        }
                        Err(e) => {
                            error!("[{}] STARTTLS error: {}", self.remote_addr, e);
                            return Err(e);
                        }
                    }
                }
                Ok(cmd) => {
                    let response = self.handle_command(cmd).await?;
                    buf_reader.write_all(response.as_bytes()).await?;

                    if response.starts_with("221") {
                        return Ok(SessionResult::Quit);
                    }

                    if self.state == SmtpState::Data {
                        if let Err(e) = self.receive_data(&mut buf_reader).await {
                            error!("[{}] Error receiving DATA: {}", self.remote_addr, e);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    debug!("[{}] Command parse error: {}", self.remote_addr, e);
                    buf_reader
                        .write_all(b"500 Syntax error, command unrecognized\r\n")
                        .await?;
                    self.error_count += 1;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> Result<String> {
        match (&self.state, cmd) {
            (_, SmtpCommand::Helo(domain)) => {
                info!("[{}] HELO from {}", self.remote_addr, domain);
                self.helo_name = domain.clone();
                self.reset_envelope();
                self.state = SmtpState::Greeted;
                Ok(format!(
                    "250 {} Hello {}\r\n",
                    self.backend.hostname, domain
                ))
            }
            (_, SmtpCommand::Ehlo(domain)) => {
                info!("[{}] EHLO from {}", self.remote_addr, domain);
                self.helo_name = domain.clone();
                self.reset_envelope();
                self.state = SmtpState::Greeted;

                let mut response = format!("250-{} Hello {}\r\n", self.backend.hostname, domain);
                response.push_str(&format!("250-SIZE {}\r\n", self.backend.max_message_size));
                if self.backend.tls.is_some() && !self.is_encrypted {
                    response.push_str("250-STARTTLS\r\n");
                }
                response.push_str("250 8BITMIME\r\n");
                Ok(response)
            }
            (SmtpState::Greeted, SmtpCommand::MailFrom { path, size }) => {
                if let Some(declared) = size {
                    if declared > self.backend.max_message_size as u64 {
                        warn!(
                            "[{}] MAIL FROM rejected: declared size {} over limit",
                            self.remote_addr, declared
                        );
                        return Ok("552 Message size exceeds maximum\r\n".to_string());
                    }
                }

                // The null reverse-path (bounces) is always accepted.
                let sender = if path.is_empty() {
                    String::new()
                } else {
                    match parse_address(&path) {
                        Ok(addr) => addr,
                        Err(_) => {
                            self.error_count += 1;
                            return Ok("553 Invalid sender address\r\n".to_string());
                        }
                    }
                };

                info!("[{}] MAIL FROM: <{}>", self.remote_addr, sender);
                self.from = Some(sender);
                self.to.clear();
                self.data.clear();
                self.state = SmtpState::MailFrom;
                Ok("250 OK\r\n".to_string())
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(path)) => {
                self.handle_rcpt(&path).await
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                info!(
                    "[{}] DATA: <{}> -> {} recipient(s)",
                    self.remote_addr,
                    self.from.as_deref().unwrap_or(""),
                    self.to.len()
                );
                self.state = SmtpState::Data;
                Ok("354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string())
            }
            (_, SmtpCommand::Rset) => {
                debug!("[{}] RSET", self.remote_addr);
                self.reset_envelope();
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Greeted;
                }
                Ok("250 OK\r\n".to_string())
            }
            (_, SmtpCommand::Noop) => Ok("250 OK\r\n".to_string()),
            (_, SmtpCommand::Quit) => {
                debug!("[{}] QUIT", self.remote_addr);
                Ok(format!(
                    "221 {} closing connection\r\n",
                    self.backend.hostname
                ))
            }
            (_, SmtpCommand::Auth(mechanism)) => {
                // Inbound-only MX: nothing to authenticate against.
                info!(
                    "[{}] AUTH {} refused (not supported)",
                    self.remote_addr, mechanism
                );
                Ok("503 Authentication not available on this server\r\n".to_string())
            }
            (_, SmtpCommand::Starttls) => {
                // Handled before dispatch; reaching here is out-of-order.
                Ok("503 Bad sequence of commands\r\n".to_string())
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                debug!("[{}] Unknown command: {}", self.remote_addr, cmd);
                self.error_count += 1;
                Ok("502 Command not implemented\r\n".to_string())
            }
            _ => {
                self.error_count += 1;
                Ok("503 Bad sequence of commands\r\n".to_string())
            }
        }
    }

    /// Apply the recipient-acceptance policy: well-formed address, domain
    /// in the configured set, mailbox present in the store.
    async fn handle_rcpt(&mut self, path: &str) -> Result<String> {
        if self.to.len() >= MAX_RECIPIENTS {
            warn!(
                "[{}] RCPT rejected: too many recipients",
                self.remote_addr
            );
            return Ok(format!(
                "452 Too many recipients (max {})\r\n",
                MAX_RECIPIENTS
            ));
        }

        let addr = match parse_address(path) {
            Ok(addr) => addr,
            Err(_) => {
                info!(
                    "[{}] RCPT rejected: invalid address format: {}",
                    self.remote_addr, path
                );
                self.error_count += 1;
                return Ok("553 Invalid recipient address\r\n".to_string());
            }
        };

        let Some((_, domain)) = split_address(&addr) else {
            self.error_count += 1;
            return Ok("553 Invalid recipient address\r\n".to_string());
        };

        if !self.backend.domains.contains(domain) {
            info!(
                "[{}] RCPT rejected: domain not accepted: {}",
                self.remote_addr, domain
            );
            return Ok(format!("550 Relay access denied for domain {}\r\n", domain));
        }

        match self.backend.store.address_exists(&addr).await {
            Ok(true) => {
                info!(
                    "[{}] RCPT accepted: <{}> ({} total)",
                    self.remote_addr,
                    addr,
                    self.to.len() + 1
                );
                self.to.push(addr);
                self.state = SmtpState::RcptTo;
                Ok("250 OK\r\n".to_string())
            }
            Ok(false) => {
                info!(
                    "[{}] RCPT rejected: no mailbox for <{}>",
                    self.remote_addr, addr
                );
                Ok("550 No such mailbox here\r\n".to_string())
            }
            Err(e) => {
                error!(
                    "[{}] RCPT lookup failed for <{}>: {}",
                    self.remote_addr, addr, e
                );
                Ok("451 Temporary local error, try again later\r\n".to_string())
            }
        }
    }

    /// Read the message body up to `<CRLF>.<CRLF>`, bounded by the
    /// configured size; over-limit input is drained and refused with 552.
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line: Vec<u8> = Vec::new();
        let mut oversized = false;

        loop {
            line.clear();

            let read_result = timeout(DATA_TIMEOUT, buf_reader.read_until(b'\n', &mut line)).await;

            let n = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(e.into());
                }
                Err(_) => {
                    return Err(MailError::SmtpProtocol("Timeout during DATA".to_string()));
                }
            };

            if n == 0 {
                return Err(MailError::SmtpProtocol(
                    "Connection closed during DATA".to_string(),
                ));
            }

            // End-of-data marker
            if line == b".\r\n" || line == b".\n" {
                break;
            }

            if oversized {
                continue;
            }

            if self.data.len() + line.len() > self.backend.max_message_size {
                warn!(
                    "[{}] Message exceeds size limit ({} bytes max), draining",
                    self.remote_addr, self.backend.max_message_size
                );
                oversized = true;
                continue;
            }

            // Dot transparency (RFC 5321 §4.5.2)
            if line.starts_with(b"..") {
                self.data.extend_from_slice(&line[1..]);
            } else {
                self.data.extend_from_slice(&line);
            }
        }

        if oversized {
            self.data.clear();
            buf_reader
                .write_all(b"552 Message too large\r\n")
                .await?;
            self.reset_after_data();
            return Ok(());
        }

        if self.data.is_empty() {
            buf_reader
                .write_all(b"554 Error processing message\r\n")
                .await?;
            self.reset_after_data();
            return Ok(());
        }

        self.process_message(buf_reader).await
    }

    /// Extract, authenticate and store the received message, then reply.
    async fn process_message<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = std::mem::take(&mut self.data);
        let received_at = Utc::now();

        info!(
            "[{}] Received message ({} bytes)",
            self.remote_addr,
            raw.len()
        );

        let parsed = match MimeParser::extract(&raw, received_at) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[{}] Failed to parse message: {}", self.remote_addr, e);
                buf_reader
                    .write_all(b"554 Error processing message\r\n")
                    .await?;
                self.reset_after_data();
                return Ok(());
            }
        };

        let attachments: Vec<AttachmentRecord> = parsed
            .attachments
            .iter()
            .map(|a| AttachmentRecord {
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
                size_bytes: a.data.len() as i64,
                data: a.data.clone(),
            })
            .collect();

        let mut body_plain = parsed.body_plain;
        if body_plain.is_empty() && parsed.body_html.is_empty() {
            body_plain = EMPTY_BODY_PLACEHOLDER.to_string();
        }

        let mut record = EmailRecord {
            message_id: parsed.message_id,
            subject: parsed.subject,
            from_address: self.from.clone().unwrap_or_default(),
            to_address: String::new(),
            raw_headers: parsed.raw_headers,
            body_plain,
            body_html: parsed.body_html,
            size_bytes: raw.len() as i64,
            raw_message: raw,
            dkim_valid: Default::default(),
            spf_result: None,
            dmarc_result: None,
            has_attachments: !attachments.is_empty(),
            received_at,
        };

        if let Some(authenticator) = &self.backend.authenticator {
            let client_ip = self.remote_addr.ip().to_string();
            let verdict = authenticator
                .authenticate(
                    &record.raw_message,
                    &record.from_address,
                    &client_ip,
                    &self.helo_name,
                )
                .await;

            record.dkim_valid = verdict.dkim;
            record.spf_result = Some(verdict.spf);
            record.dmarc_result = Some(verdict.dmarc);
        }

        info!(
            "[{}] Parsed - Subject: '{}', Attachments: {}",
            self.remote_addr,
            record.subject,
            attachments.len()
        );

        // One emails row per recipient, each in its own transaction;
        // earlier commits survive a later failure.
        for recipient in self.to.clone() {
            record.to_address = recipient.clone();

            if let Err(e) = self.backend.store.store_email(&record, &attachments).await {
                error!(
                    "[{}] Failed to store email for {}: {}",
                    self.remote_addr, recipient, e
                );
                buf_reader
                    .write_all(b"451 Error storing message, try again later\r\n")
                    .await?;
                self.reset_after_data();
                return Ok(());
            }
        }

        info!(
            "[{}] Email delivered to {} recipient(s)",
            self.remote_addr,
            self.to.len()
        );

        buf_reader
            .write_all(b"250 OK: Message accepted for delivery\r\n")
            .await?;
        self.reset_after_data();
        Ok(())
    }

    fn reset_envelope(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
    }

    fn reset_after_data(&mut self) {
        self.reset_envelope();
        self.state = SmtpState::Greeted;
    }

    /// Perform the STARTTLS upgrade in place.
    ///
    /// Requires EHLO/HELO first, a configured certificate and a plaintext
    /// connection; the session state resets to fresh afterwards (RFC 3207).
    async fn handle_starttls_upgrade(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls_config = match &self.backend.tls {
            Some(config) => config.clone(),
            None => {
                stream.write_all(b"502 STARTTLS not available\r\n").await?;
                return Ok(false);
            }
        };

        if self.is_encrypted {
            stream.write_all(b"503 Already using TLS\r\n").await?;
            return Ok(false);
        }

        if self.state != SmtpState::Greeted {
            stream
                .write_all(b"503 Bad sequence of commands\r\n")
                .await?;
            return Ok(false);
        }

        stream.write_all(b"220 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            _ => {
                return Err(MailError::SmtpProtocol(
                    "Internal error: stream state mismatch".to_string(),
                ));
            }
        };

        let acceptor = tls_config.acceptor();
        let tls_stream = acceptor.accept(tcp_stream).await.map_err(|e| {
            error!("[{}] TLS handshake failed: {}", self.remote_addr, e);
            MailError::Tls(format!("TLS handshake failed: {}", e))
        })?;

        *stream = SmtpStream::Tls(tls_stream);
        self.is_encrypted = true;
        self.reset_envelope();
        self.state = SmtpState::Fresh;

        Ok(true)
    }
}
