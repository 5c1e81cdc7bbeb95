//! End-to-end SMTP dialogues against an in-process server with a mock
//! mail store.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempmail_mx::config::Config;
use tempmail_mx::error::Result;
use tempmail_mx::smtp::SmtpServer;
use tempmail_mx::store::{AttachmentRecord, EmailRecord, MailStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// In-memory stand-in for the PostgreSQL store.
struct MockStore {
    addresses: HashSet<String>,
    /// Accept any local part on this domain (for the recipient-cap test).
    accept_domain: Option<String>,
    stored: Mutex<Vec<(EmailRecord, Vec<AttachmentRecord>)>>,
}

impl MockStore {
    fn with_addresses(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            accept_domain: None,
            stored: Mutex::new(Vec::new()),
        })
    }

    fn accept_all(domain: &str) -> Arc<Self> {
        Arc::new(Self {
            addresses: HashSet::new(),
            accept_domain: Some(domain.to_string()),
            stored: Mutex::new(Vec::new()),
        })
    }

    fn stored(&self) -> Vec<(EmailRecord, Vec<AttachmentRecord>)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailStore for MockStore {
    async fn address_exists(&self, email: &str) -> Result<bool> {
        let email = email.to_lowercase();
        if let Some(domain) = &self.accept_domain {
            if email.ends_with(&format!("@{}", domain)) {
                return Ok(true);
            }
        }
        Ok(self.addresses.contains(&email))
    }

    async fn store_email(
        &self,
        email: &EmailRecord,
        attachments: &[AttachmentRecord],
    ) -> Result<()> {
        self.stored
            .lock()
            .unwrap()
            .push((email.clone(), attachments.to_vec()));
        Ok(())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.domains = vec!["tempmail.example.com".to_string()];
    config
}

async fn start_server(config: Config, store: Arc<MockStore>) -> (SocketAddr, watch::Sender<bool>) {
    let server = SmtpServer::new(&config, store).expect("server should build");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let _ = server.serve(listener, shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = client.read_line().await;
        assert!(greeting.starts_with("220"), "greeting was: {}", greeting);
        client
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    /// Send a command, read a single-line reply.
    async fn cmd(&mut self, command: &str) -> String {
        self.writer
            .write_all(format!("{}\r\n", command).as_bytes())
            .await
            .unwrap();
        self.read_line().await
    }

    /// Send EHLO, collecting the multiline reply.
    async fn ehlo(&mut self, name: &str) -> Vec<String> {
        self.writer
            .write_all(format!("EHLO {}\r\n", name).as_bytes())
            .await
            .unwrap();

        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.len() >= 4 && &line[3..4] == " ";
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    /// Send a raw payload (DATA body), then the terminator, then read the
    /// reply.
    async fn send_data(&mut self, body: &str) -> String {
        self.writer.write_all(body.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n.\r\n").await.unwrap();
        self.read_line().await
    }
}

#[tokio::test]
async fn test_greeting_and_ehlo_capabilities() {
    let store = MockStore::with_addresses(&[]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    let lines = client.ehlo("client.example.org").await;

    assert!(lines[0].starts_with("250-"));
    assert!(lines.iter().any(|l| l.contains("SIZE")));
    assert!(lines.iter().any(|l| l.contains("8BITMIME")));
    // No TLS configured, so STARTTLS must not be advertised
    assert!(!lines.iter().any(|l| l.contains("STARTTLS")));

    assert!(client.cmd("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn test_reject_unknown_domain() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;

    assert!(client.cmd("MAIL FROM:<a@b.com>").await.starts_with("250"));
    let reply = client.cmd("RCPT TO:<x@other.com>").await;
    assert!(reply.starts_with("550"), "reply was: {}", reply);

    client.cmd("QUIT").await;
    assert!(store.stored().is_empty());
}

#[tokio::test]
async fn test_reject_nonexistent_mailbox() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;

    let reply = client.cmd("RCPT TO:<ghost@tempmail.example.com>").await;
    assert!(reply.starts_with("550"), "reply was: {}", reply);

    // The session survives the rejection
    let reply = client.cmd("RCPT TO:<alive@tempmail.example.com>").await;
    assert!(reply.starts_with("250"), "reply was: {}", reply);

    client.cmd("QUIT").await;
    assert!(store.stored().is_empty());
}

#[tokio::test]
async fn test_happy_path_with_attachment() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("sender.example.org").await;
    assert!(client
        .cmd("MAIL FROM:<sender@example.org>")
        .await
        .starts_with("250"));
    assert!(client
        .cmd("RCPT TO:<alive@tempmail.example.com>")
        .await
        .starts_with("250"));
    assert!(client.cmd("DATA").await.starts_with("354"));

    let body = "From: sender@example.org\r\n\
        To: alive@tempmail.example.com\r\n\
        Subject: With Attachment\r\n\
        Message-ID: <m1@example.org>\r\n\
        Content-Type: multipart/mixed; boundary=\"boundary123\"\r\n\
        \r\n\
        --boundary123\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        hi\r\n\
        --boundary123\r\n\
        Content-Type: application/pdf; name=\"document.pdf\"\r\n\
        Content-Disposition: attachment; filename=\"document.pdf\"\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        JVBERi0xLjQ=\r\n\
        --boundary123--";

    let reply = client.send_data(body).await;
    assert!(reply.starts_with("250"), "reply was: {}", reply);
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 1);

    let (record, attachments) = &stored[0];
    assert_eq!(record.from_address, "sender@example.org");
    assert_eq!(record.to_address, "alive@tempmail.example.com");
    assert_eq!(record.subject, "With Attachment");
    assert_eq!(record.message_id.as_deref(), Some("<m1@example.org>"));
    assert_eq!(record.body_plain, "hi");
    assert!(record.has_attachments);
    assert_eq!(record.size_bytes as usize, record.raw_message.len());
    assert!(record.raw_headers.contains("Subject: With Attachment"));

    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filename, "document.pdf");
    assert_eq!(attachments[0].content_type, "application/pdf");
    assert_eq!(attachments[0].data, b"%PDF-1.4");
    assert_eq!(attachments[0].size_bytes, attachments[0].data.len() as i64);

    // Authentication disabled: all three verdicts stay unset
    assert_eq!(record.dkim_valid.as_db(), None);
    assert!(record.spf_result.is_none());
    assert!(record.dmarc_result.is_none());
}

#[tokio::test]
async fn test_message_stored_once_per_recipient() {
    let store = MockStore::with_addresses(&[
        "first@tempmail.example.com",
        "second@tempmail.example.com",
    ]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    assert!(client
        .cmd("RCPT TO:<first@tempmail.example.com>")
        .await
        .starts_with("250"));
    assert!(client
        .cmd("RCPT TO:<second@tempmail.example.com>")
        .await
        .starts_with("250"));
    client.cmd("DATA").await;

    let reply = client
        .send_data("From: a@b.com\r\nSubject: hello\r\n\r\nbody")
        .await;
    assert!(reply.starts_with("250"));
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 2);

    let recipients: Vec<&str> = stored.iter().map(|(r, _)| r.to_address.as_str()).collect();
    assert!(recipients.contains(&"first@tempmail.example.com"));
    assert!(recipients.contains(&"second@tempmail.example.com"));

    // The same message bytes land once per recipient
    assert_eq!(stored[0].0.raw_message, stored[1].0.raw_message);
}

#[tokio::test]
async fn test_recipient_is_lowercased() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    assert!(client
        .cmd("RCPT TO:<ALIVE@TEMPMAIL.EXAMPLE.COM>")
        .await
        .starts_with("250"));
    client.cmd("DATA").await;
    client.send_data("Subject: x\r\n\r\nbody").await;
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0.to_address, "alive@tempmail.example.com");
}

#[tokio::test]
async fn test_command_ordering_enforced() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;

    // MAIL before EHLO
    assert!(client.cmd("MAIL FROM:<a@b.com>").await.starts_with("503"));

    client.ehlo("foo").await;

    // RCPT before MAIL
    assert!(client
        .cmd("RCPT TO:<alive@tempmail.example.com>")
        .await
        .starts_with("503"));

    // DATA before RCPT
    client.cmd("MAIL FROM:<a@b.com>").await;
    assert!(client.cmd("DATA").await.starts_with("503"));

    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_auth_refused_and_misc_verbs() {
    let store = MockStore::with_addresses(&[]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;

    assert!(client.cmd("AUTH PLAIN dGVzdA==").await.starts_with("503"));
    assert!(client.cmd("NOOP").await.starts_with("250"));
    assert!(client.cmd("RSET").await.starts_with("250"));
    assert!(client.cmd("VRFY someone").await.starts_with("502"));
    assert!(client.cmd("HELO foo").await.starts_with("250"));
    assert!(client.cmd("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn test_rset_clears_transaction() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    client.cmd("RCPT TO:<alive@tempmail.example.com>").await;

    assert!(client.cmd("RSET").await.starts_with("250"));

    // The envelope is gone: DATA needs a fresh MAIL/RCPT
    assert!(client.cmd("DATA").await.starts_with("503"));
    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_null_reverse_path_accepted() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;

    assert!(client.cmd("MAIL FROM:<>").await.starts_with("250"));
    assert!(client
        .cmd("RCPT TO:<alive@tempmail.example.com>")
        .await
        .starts_with("250"));
    client.cmd("DATA").await;
    let reply = client.send_data("Subject: bounce\r\n\r\nreturned mail").await;
    assert!(reply.starts_with("250"));
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0.from_address, "");
}

#[tokio::test]
async fn test_malformed_recipient_rejected() {
    let store = MockStore::with_addresses(&[]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;

    assert!(client.cmd("RCPT TO:<invalid-email>").await.starts_with("553"));
    assert!(client.cmd("RCPT TO:<nodomain@>").await.starts_with("553"));
    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_declared_size_over_limit_rejected() {
    let store = MockStore::with_addresses(&[]);
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;

    let reply = client
        .cmd("MAIL FROM:<a@b.com> SIZE=99999999999")
        .await;
    assert!(reply.starts_with("552"), "reply was: {}", reply);
    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_oversized_body_refused() {
    let mut config = test_config();
    config.server.max_message_size_mb = 1;

    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(config, store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    client.cmd("RCPT TO:<alive@tempmail.example.com>").await;
    assert!(client.cmd("DATA").await.starts_with("354"));

    // ~1.5 MB of body against a 1 MB cap
    let line = "a".repeat(998);
    let mut body = String::from("Subject: big\r\n\r\n");
    for _ in 0..1500 {
        body.push_str(&line);
        body.push_str("\r\n");
    }

    let reply = client.send_data(&body).await;
    assert!(reply.starts_with("552"), "reply was: {}", reply);
    client.cmd("QUIT").await;

    assert!(store.stored().is_empty());
}

#[tokio::test]
async fn test_empty_data_is_a_parse_failure() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    client.cmd("RCPT TO:<alive@tempmail.example.com>").await;
    assert!(client.cmd("DATA").await.starts_with("354"));

    // Terminator straight away: no message at all
    assert!(client.cmd(".").await.starts_with("554"));
    client.cmd("QUIT").await;

    assert!(store.stored().is_empty());
}

#[tokio::test]
async fn test_html_only_message_gets_placeholder() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    client.cmd("RCPT TO:<alive@tempmail.example.com>").await;
    client.cmd("DATA").await;

    let body = "Subject: html\r\n\
        Content-Type: multipart/alternative; boundary=\"b\"\r\n\
        \r\n\
        --b\r\n\
        Content-Type: text/html\r\n\
        \r\n\
        <p>hello</p>\r\n\
        --b--";
    assert!(client.send_data(body).await.starts_with("250"));
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].0.body_plain,
        "[HTML email - plain text not provided]"
    );
    assert_eq!(stored[0].0.body_html, "<p>hello</p>");
}

#[tokio::test]
async fn test_recipient_cap() {
    let store = MockStore::accept_all("tempmail.example.com");
    let (addr, _shutdown) = start_server(test_config(), store).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;

    for i in 0..50 {
        let reply = client
            .cmd(&format!("RCPT TO:<user{}@tempmail.example.com>", i))
            .await;
        assert!(reply.starts_with("250"), "recipient {} got: {}", i, reply);
    }

    let reply = client.cmd("RCPT TO:<overflow@tempmail.example.com>").await;
    assert!(reply.starts_with("452"), "reply was: {}", reply);
    client.cmd("QUIT").await;
}

#[tokio::test]
async fn test_dot_unstuffing_round_trips() {
    let store = MockStore::with_addresses(&["alive@tempmail.example.com"]);
    let (addr, _shutdown) = start_server(test_config(), store.clone()).await;

    let mut client = Client::connect(addr).await;
    client.ehlo("foo").await;
    client.cmd("MAIL FROM:<a@b.com>").await;
    client.cmd("RCPT TO:<alive@tempmail.example.com>").await;
    client.cmd("DATA").await;

    // A line starting with a dot must arrive unstuffed
    let body = "Subject: dots\r\n\r\nfirst line\r\n..second line starts with a dot";
    assert!(client.send_data(body).await.starts_with("250"));
    client.cmd("QUIT").await;

    let stored = store.stored();
    assert_eq!(stored.len(), 1);
    let raw = String::from_utf8_lossy(&stored[0].0.raw_message).to_string();
    assert!(raw.contains("\r\n.second line starts with a dot"));
    assert!(!raw.contains(".."));
}
