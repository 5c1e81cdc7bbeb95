use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};

use super::types::{AttachmentPart, ExtractedMail, MimePart};

/// MIME message extractor.
///
/// Decodes a raw RFC 5322 message into headers, text bodies and an
/// attachment list, descending into nested multiparts.
pub struct MimeParser;

impl MimeParser {
    /// Extract the structured representation of a raw message.
    ///
    /// `received_at` substitutes for a missing or unparseable `Date:`
    /// header. An empty or header-less message is a fatal error for this
    /// message.
    pub fn extract(message: &[u8], received_at: DateTime<Utc>) -> Result<ExtractedMail> {
        if message.is_empty() {
            bail!("empty message");
        }

        let message_str = String::from_utf8_lossy(message);
        let (headers_str, body_str) = Self::split_headers_body(&message_str);
        let headers = Self::parse_headers(&headers_str);

        if headers.is_empty() {
            bail!("message has no headers");
        }

        let message_id = Self::first_header(&headers, "message-id").map(|v| v.to_string());
        let subject = Self::first_header(&headers, "subject")
            .unwrap_or_default()
            .to_string();

        let sent_at = Self::first_header(&headers, "date")
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(received_at);

        let mut raw_headers = String::new();
        for (key, value) in &headers {
            raw_headers.push_str(key);
            raw_headers.push_str(": ");
            raw_headers.push_str(value);
            raw_headers.push('\n');
        }

        let mut parts = Vec::new();
        Self::collect_parts(&headers, &body_str, &mut parts, 0)?;

        let mut body_plain = String::new();
        let mut body_html = String::new();
        let mut attachments = Vec::new();

        for part in parts {
            if part.is_attachment() {
                let data = Self::decode_body(&part)?;
                attachments.push(AttachmentPart {
                    filename: part.filename.clone().unwrap_or_default(),
                    content_type: part.content_type.clone(),
                    data,
                });
            } else if part.is_text_body() {
                let decoded = Self::decode_body(&part)?;
                let text = String::from_utf8_lossy(&decoded);
                let target = if part.content_type == "text/html" {
                    &mut body_html
                } else {
                    &mut body_plain
                };
                if !target.is_empty() {
                    target.push('\n');
                }
                target.push_str(text.trim_end_matches(['\r', '\n']));
            }
            // Non-body parts without a filename are dropped.
        }

        if body_plain.is_empty() && !body_html.is_empty() {
            body_plain = "[HTML email - plain text not provided]".to_string();
        }

        Ok(ExtractedMail {
            message_id,
            subject,
            sent_at,
            raw_headers,
            body_plain,
            body_html,
            attachments,
        })
    }

    /// Split message into headers and body at the first blank line.
    fn split_headers_body(message: &str) -> (String, String) {
        if let Some(pos) = message.find("\r\n\r\n") {
            (message[..pos].to_string(), message[pos + 4..].to_string())
        } else if let Some(pos) = message.find("\n\n") {
            (message[..pos].to_string(), message[pos + 2..].to_string())
        } else {
            (message.to_string(), String::new())
        }
    }

    /// Parse a header block, unfolding continuation lines and keeping
    /// order and multiplicity.
    fn parse_headers(headers_str: &str) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut current: Option<(String, String)> = None;

        for line in headers_str.lines() {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                if let Some((_, ref mut value)) = current {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            } else if let Some(colon_pos) = line.find(':') {
                if let Some(header) = current.take() {
                    headers.push(header);
                }

                let name = line[..colon_pos].trim().to_string();
                let value = line[colon_pos + 1..].trim().to_string();
                current = Some((name, value));
            }
        }

        if let Some(header) = current {
            headers.push(header);
        }

        headers
    }

    fn first_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Walk one entity (the whole message or a nested part), pushing its
    /// leaf parts into `out`.
    fn collect_parts(
        headers: &[(String, String)],
        body: &str,
        out: &mut Vec<MimePart>,
        depth: usize,
    ) -> Result<()> {
        // A hostile message could nest boundaries arbitrarily deep.
        if depth > 16 {
            bail!("multipart nesting too deep");
        }

        let content_type_raw = Self::first_header(headers, "content-type").unwrap_or("text/plain");

        if !Self::media_type(content_type_raw).starts_with("multipart/") {
            out.push(Self::leaf_part(headers, body));
            return Ok(());
        }

        let Some(boundary) = Self::extract_boundary(content_type_raw) else {
            // No usable boundary: treat the whole body as plain text.
            out.push(MimePart {
                body: body.as_bytes().to_vec(),
                ..Default::default()
            });
            return Ok(());
        };

        let marker = format!("--{}", boundary);
        for section in body.split(&marker) {
            let section = section.trim_start_matches(['\r', '\n']);

            // Preamble, epilogue and the terminal "--" marker
            if section.trim().is_empty() || section.starts_with("--") {
                continue;
            }

            let (section_headers_str, section_body) = Self::split_headers_body(section);
            let section_headers = Self::parse_headers(&section_headers_str);
            Self::collect_parts(&section_headers, &section_body, out, depth + 1)?;
        }

        Ok(())
    }

    /// Build a leaf MimePart from its header list and raw body.
    fn leaf_part(headers: &[(String, String)], body: &str) -> MimePart {
        let mut part = MimePart {
            body: body.as_bytes().to_vec(),
            ..Default::default()
        };

        if let Some(content_type) = Self::first_header(headers, "content-type") {
            part.content_type = Self::media_type(content_type);

            if let Some(name) = Self::extract_parameter(content_type, "name") {
                part.filename = Some(name);
            }
        }

        if let Some(disposition) = Self::first_header(headers, "content-disposition") {
            part.content_disposition = Some(disposition.to_string());

            if let Some(filename) = Self::extract_parameter(disposition, "filename") {
                part.filename = Some(filename);
            }
        }

        if let Some(encoding) = Self::first_header(headers, "content-transfer-encoding") {
            part.encoding = Some(encoding.to_string());
        }

        part
    }

    /// Bare media type: parameters stripped, lowercased.
    fn media_type(content_type: &str) -> String {
        content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase()
    }

    /// Extract the boundary from a Content-Type header value.
    fn extract_boundary(content_type: &str) -> Option<String> {
        Self::extract_parameter(content_type, "boundary")
    }

    /// Extract a parameter value from a structured header
    /// (e.g. `filename="file.txt"`).
    fn extract_parameter(header: &str, param_name: &str) -> Option<String> {
        for part in header.split(';') {
            let part = part.trim();
            let prefix = format!("{}=", param_name);
            if part.to_lowercase().starts_with(&prefix) {
                let value = &part[prefix.len()..];
                let value = value.trim_matches('"').trim_matches('\'');
                return Some(value.to_string());
            }
        }
        None
    }

    /// Decode a part body according to its Content-Transfer-Encoding.
    fn decode_body(part: &MimePart) -> Result<Vec<u8>> {
        match part.encoding.as_deref().map(str::to_lowercase) {
            Some(encoding) if encoding.contains("base64") => Self::decode_base64(&part.body),
            Some(encoding) if encoding.contains("quoted-printable") => {
                Ok(Self::decode_quoted_printable(&part.body))
            }
            // 7bit, 8bit, binary: nothing to undo
            _ => Ok(part.body.clone()),
        }
    }

    fn decode_base64(content: &[u8]) -> Result<Vec<u8>> {
        let cleaned: Vec<u8> = content
            .iter()
            .filter(|&&b| !b.is_ascii_whitespace())
            .copied()
            .collect();

        general_purpose::STANDARD
            .decode(&cleaned)
            .map_err(|e| anyhow!("Base64 decode error: {}", e))
    }

    fn decode_quoted_printable(content: &[u8]) -> Vec<u8> {
        let mut result = Vec::new();
        let text = String::from_utf8_lossy(content);
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch == '=' {
                // Soft line break
                if chars.peek() == Some(&'\n') || chars.peek() == Some(&'\r') {
                    chars.next();
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    continue;
                }

                let mut hex = String::new();
                if let Some(c1) = chars.next() {
                    hex.push(c1);
                }
                if let Some(c2) = chars.next() {
                    hex.push(c2);
                }

                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte);
                } else {
                    // Invalid escape, keep verbatim
                    result.push(b'=');
                    result.extend(hex.as_bytes());
                }
            } else {
                let mut buf = [0u8; 4];
                result.extend(ch.encode_utf8(&mut buf).as_bytes());
            }
        }

        result
    }
}
