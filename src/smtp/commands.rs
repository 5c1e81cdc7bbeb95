//! SMTP command parsing.
//!
//! Covers the RFC 5321 verb subset an inbound-only MX needs. Verbs are
//! recognized case-insensitively; unknown verbs are preserved for the 502
//! reply.

use crate::error::{MailError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// MAIL FROM with the reverse-path (may be empty for bounces) and the
    /// declared SIZE parameter when the client sent one.
    MailFrom {
        path: String,
        size: Option<u64>,
    },
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Starttls,
    /// AUTH is always refused on this server but must parse cleanly.
    Auth(String),
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(MailError::SmtpProtocol("Empty command".to_string()));
        }

        let parts: Vec<&str> = line.splitn(2, ' ').collect();
        let command = parts[0].to_uppercase();
        let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => Self::parse_mail_from(args),
            "RCPT" => Self::parse_rcpt_to(args),
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::Starttls),
            "AUTH" => {
                if args.is_empty() {
                    return Err(MailError::SmtpProtocol(
                        "AUTH requires mechanism".to_string(),
                    ));
                }
                let mechanism = args.split_whitespace().next().unwrap_or("").to_string();
                Ok(SmtpCommand::Auth(mechanism))
            }
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<path> [param...]`, extracting a SIZE declaration when
    /// present.
    fn parse_mail_from(args: &str) -> Result<Self> {
        if !args.to_uppercase().starts_with("FROM:") {
            return Err(MailError::SmtpProtocol(
                "Invalid MAIL FROM syntax".to_string(),
            ));
        }

        let rest = args[5..].trim();
        let (path, params) = Self::split_path(rest);

        let mut size = None;
        for param in params.split_whitespace() {
            if let Some(value) = param
                .strip_prefix("SIZE=")
                .or_else(|| param.strip_prefix("size="))
            {
                size = value.parse::<u64>().ok();
            }
        }

        Ok(SmtpCommand::MailFrom {
            path: path.to_string(),
            size,
        })
    }

    /// Parse `TO:<path>`.
    fn parse_rcpt_to(args: &str) -> Result<Self> {
        if !args.to_uppercase().starts_with("TO:") {
            return Err(MailError::SmtpProtocol(
                "Invalid RCPT TO syntax".to_string(),
            ));
        }

        let rest = args[3..].trim();
        let (path, _) = Self::split_path(rest);
        Ok(SmtpCommand::RcptTo(path.to_string()))
    }

    /// Split an argument string into the path and the trailing ESMTP
    /// parameters. The path may be angle-bracketed or bare.
    fn split_path(rest: &str) -> (&str, &str) {
        if let Some(stripped) = rest.strip_prefix('<') {
            match stripped.find('>') {
                Some(end) => (&stripped[..end], stripped[end + 1..].trim_start()),
                None => (stripped, ""),
            }
        } else {
            match rest.find(' ') {
                Some(pos) => (&rest[..pos], rest[pos + 1..].trim_start()),
                None => (rest, ""),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_ehlo() {
        let cmd = SmtpCommand::parse("EHLO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Ehlo("example.com".to_string()));
    }

    #[test]
    fn test_parse_mail_from() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com>").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                path: "sender@example.com".to_string(),
                size: None,
            }
        );
    }

    #[test]
    fn test_parse_mail_from_null_path() {
        let cmd = SmtpCommand::parse("MAIL FROM:<>").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                path: String::new(),
                size: None,
            }
        );
    }

    #[test]
    fn test_parse_mail_from_with_size() {
        let cmd = SmtpCommand::parse("MAIL FROM:<sender@example.com> SIZE=1024").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                path: "sender@example.com".to_string(),
                size: Some(1024),
            }
        );
    }

    #[test]
    fn test_parse_mail_from_case_insensitive() {
        let cmd = SmtpCommand::parse("mail from:<a@b.test>").unwrap();
        assert_eq!(
            cmd,
            SmtpCommand::MailFrom {
                path: "a@b.test".to_string(),
                size: None,
            }
        );
    }

    #[test]
    fn test_parse_mail_without_from_is_error() {
        assert!(SmtpCommand::parse("MAIL sender@example.com").is_err());
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
    }

    #[test]
    fn test_parse_rcpt_to_bare_path() {
        let cmd = SmtpCommand::parse("RCPT TO:recipient@example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
    }

    #[test]
    fn test_parse_data_rset_quit_noop() {
        assert_eq!(SmtpCommand::parse("DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("RSET").unwrap(), SmtpCommand::Rset);
        assert_eq!(SmtpCommand::parse("QUIT").unwrap(), SmtpCommand::Quit);
        assert_eq!(SmtpCommand::parse("NOOP").unwrap(), SmtpCommand::Noop);
    }

    #[test]
    fn test_parse_starttls() {
        assert_eq!(
            SmtpCommand::parse("STARTTLS").unwrap(),
            SmtpCommand::Starttls
        );
    }

    #[test]
    fn test_parse_auth() {
        assert_eq!(
            SmtpCommand::parse("AUTH PLAIN dGVzdA==").unwrap(),
            SmtpCommand::Auth("PLAIN".to_string())
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            SmtpCommand::parse("VRFY user").unwrap(),
            SmtpCommand::Unknown("VRFY".to_string())
        );
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(SmtpCommand::parse("").is_err());
        assert!(SmtpCommand::parse("   ").is_err());
    }
}
