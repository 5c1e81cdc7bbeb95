use crate::error::{MailError, Result};

/// Basic email address validation.
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("Email is empty".to_string()));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(MailError::InvalidEmail("Invalid email format".to_string()));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(MailError::InvalidEmail(
            "Email parts cannot be empty".to_string(),
        ));
    }

    if local.chars().any(char::is_whitespace) || domain.chars().any(char::is_whitespace) {
        return Err(MailError::InvalidEmail(
            "Email must not contain whitespace".to_string(),
        ));
    }

    Ok(())
}

/// Parse a recipient or sender as it appears on the wire and normalize it
/// to a bare lowercase addr-spec.
///
/// Accepts `user@domain`, `<user@domain>` and `Name <user@domain>`.
pub fn parse_address(raw: &str) -> Result<String> {
    let raw = raw.trim();

    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };

    let addr = addr.trim();
    validate_email(addr)?;
    Ok(addr.to_lowercase())
}

/// Split a normalized address into local part and domain.
pub fn split_address(email: &str) -> Option<(&str, &str)> {
    let mut parts = email.splitn(2, '@');
    let local = parts.next()?;
    let domain = parts.next()?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}

/// Extract the domain from an envelope address, lowercased. Empty when the
/// input is not an addr-spec (e.g. the null reverse-path).
pub fn sender_domain(email: &str) -> String {
    let email = email.trim().trim_matches(|c| c == '<' || c == '>');
    match split_address(email) {
        Some((_, domain)) => domain.to_lowercase(),
        None => String::new(),
    }
}
