//! Email address types.

use crate::error::{Error, Result};

/// Maximum length of a forward or reverse path (RFC 5321 4.5.3.1.3).
const MAX_PATH_LENGTH: usize = 256;

/// Maximum length of the local part (RFC 5321 4.5.3.1.1).
const MAX_LOCAL_PART_LENGTH: usize = 64;

/// Maximum length of the domain (RFC 5321 4.5.3.1.2).
const MAX_DOMAIN_LENGTH: usize = 255;

/// Email address for SMTP envelope.
///
/// Validation is syntactic only: exactly one `@`, non-empty local part and
/// domain, no whitespace, control characters or angle brackets, and the
/// RFC 5321 length limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        Self::validate(&addr)?;
        Ok(Self(addr))
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the part after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(_, domain)| domain)
    }

    /// Returns true if the address needs no SMTPUTF8.
    #[must_use]
    pub fn is_ascii(&self) -> bool {
        self.0.is_ascii()
    }

    fn validate(addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress("Address cannot be empty".into()));
        }

        if addr.len() > MAX_PATH_LENGTH {
            return Err(Error::InvalidAddress(format!(
                "Address longer than {MAX_PATH_LENGTH} bytes"
            )));
        }

        if let Some(c) = addr
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>'))
        {
            return Err(Error::InvalidAddress(format!(
                "Address contains forbidden character {c:?}"
            )));
        }

        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(Error::InvalidAddress("Address must contain @".into()));
        };

        if local.contains('@') && !(local.starts_with('"') && local.ends_with('"')) {
            return Err(Error::InvalidAddress(
                "Address must have exactly one @".into(),
            ));
        }

        if local.is_empty() || domain.is_empty() {
            return Err(Error::InvalidAddress(
                "Local and domain parts cannot be empty".into(),
            ));
        }

        if local.len() > MAX_LOCAL_PART_LENGTH {
            return Err(Error::InvalidAddress(format!(
                "Local part longer than {MAX_LOCAL_PART_LENGTH} bytes"
            )));
        }

        if domain.len() > MAX_DOMAIN_LENGTH {
            return Err(Error::InvalidAddress(format!(
                "Domain longer than {MAX_DOMAIN_LENGTH} bytes"
            )));
        }

        if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
            return Err(Error::InvalidAddress(format!("Malformed domain: {domain}")));
        }

        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_address() {
        let addr = Address::new("user@example.com").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
        assert_eq!(addr.domain(), "example.com");
        assert!(addr.is_ascii());
    }

    #[test]
    fn test_invalid_address_no_at() {
        assert!(Address::new("userexample.com").is_err());
    }

    #[test]
    fn test_invalid_address_empty() {
        assert!(Address::new("").is_err());
    }

    #[test]
    fn test_invalid_address_empty_parts() {
        assert!(Address::new("@example.com").is_err());
        assert!(Address::new("user@").is_err());
    }

    #[test]
    fn test_invalid_address_two_ats() {
        assert!(Address::new("a@b@example.com").is_err());
    }

    #[test]
    fn test_quoted_local_part_with_at() {
        assert!(Address::new("\"a@b\"@example.com").is_ok());
    }

    #[test]
    fn test_forbidden_characters() {
        assert!(Address::new("user name@example.com").is_err());
        assert!(Address::new("user@exa\r\nmple.com").is_err());
        assert!(Address::new("<user@example.com>").is_err());
    }

    #[test]
    fn test_length_limits() {
        let local = "a".repeat(65);
        assert!(Address::new(format!("{local}@example.com")).is_err());
        let long_domain = format!("{}.com", "d".repeat(300));
        assert!(Address::new(format!("user@{long_domain}")).is_err());
    }

    #[test]
    fn test_malformed_domain() {
        assert!(Address::new("user@.example.com").is_err());
        assert!(Address::new("user@example..com").is_err());
    }

    #[test]
    fn test_non_ascii() {
        let addr = Address::new("jörg@exämple.de").unwrap();
        assert!(!addr.is_ascii());
    }
}
