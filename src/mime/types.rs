use chrono::{DateTime, Utc};

/// A leaf MIME part collected from the (possibly nested) multipart tree.
#[derive(Debug, Clone)]
pub struct MimePart {
    /// Bare media type, lowercased, parameters stripped.
    pub content_type: String,
    /// Content-Disposition header value, if present.
    pub content_disposition: Option<String>,
    /// Filename from Content-Disposition or the Content-Type name parameter.
    pub filename: Option<String>,
    /// Content-Transfer-Encoding (e.g. "base64", "quoted-printable").
    pub encoding: Option<String>,
    /// Raw body content, still transfer-encoded.
    pub body: Vec<u8>,
}

impl Default for MimePart {
    fn default() -> Self {
        MimePart {
            content_type: "text/plain".to_string(),
            content_disposition: None,
            filename: None,
            encoding: None,
            body: Vec::new(),
        }
    }
}

impl MimePart {
    /// A part is an attachment when it is explicitly flagged as one, or
    /// when it is a non-body part carrying a filename (inline images and
    /// the like).
    pub fn is_attachment(&self) -> bool {
        if let Some(disposition) = &self.content_disposition {
            if disposition.to_lowercase().contains("attachment") {
                return true;
            }
        }

        self.filename.is_some() && !self.is_text_body()
    }

    /// True for the parts that feed the plain/HTML bodies.
    pub fn is_text_body(&self) -> bool {
        if let Some(disposition) = &self.content_disposition {
            if disposition.to_lowercase().contains("attachment") {
                return false;
            }
        }
        self.content_type == "text/plain" || self.content_type == "text/html"
    }
}

/// One decoded attachment ready for persistence.
#[derive(Debug, Clone)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// The structured result of decoding one received message.
#[derive(Debug, Clone)]
pub struct ExtractedMail {
    /// Raw `Message-ID:` header value, if present.
    pub message_id: Option<String>,
    pub subject: String,
    /// Parsed `Date:` header; the receive instant when absent or invalid.
    pub sent_at: DateTime<Utc>,
    /// Flattened `"Key: Value\n"` lines, in order of appearance.
    pub raw_headers: String,
    pub body_plain: String,
    pub body_html: String,
    pub attachments: Vec<AttachmentPart>,
}

impl ExtractedMail {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
