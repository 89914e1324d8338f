//! Error types for the transport and pool.

use thiserror::Error;

/// Errors returned by [`SmtpTransport`](crate::SmtpTransport) and
/// [`Pool`](crate::Pool).
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol, connection or delivery failure reported by a connection.
    #[error(transparent)]
    Smtp(#[from] sendpool_smtp::Error),

    /// The pool was closed before the message was dispatched.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The worker carrying the message went away without reporting.
    #[error("Send aborted before a result was reported")]
    Aborted,

    /// Invalid transport configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the stable string code (`EAUTH`, `ECLOSED`, ...).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Smtp(err) => err.code(),
            Self::PoolClosed => "ECLOSED",
            Self::Aborted => "EABORTED",
            Self::Config(_) => "ECONFIG",
        }
    }

    /// Returns the underlying connection error, if any.
    #[must_use]
    pub const fn as_smtp(&self) -> Option<&sendpool_smtp::Error> {
        match self {
            Self::Smtp(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the server reply code attached to this error, if any.
    #[must_use]
    pub const fn response_code(&self) -> Option<u16> {
        match self {
            Self::Smtp(err) => err.response_code(),
            _ => None,
        }
    }

    /// Returns the server response text attached to this error, if any.
    #[must_use]
    pub fn response(&self) -> Option<&str> {
        self.as_smtp().and_then(sendpool_smtp::Error::response)
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

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
    fn smtp_errors_keep_their_code() {
        let err = Error::from(sendpool_smtp::Error::auth(Some(535), "bad credentials"));
        assert_eq!(err.code(), "EAUTH");
        assert_eq!(err.response_code(), Some(535));
        assert_eq!(err.response(), Some("bad credentials"));
        assert_eq!(err.to_string(), "Authentication failed: bad credentials");
    }

    #[test]
    fn pool_errors() {
        assert_eq!(Error::PoolClosed.code(), "ECLOSED");
        assert_eq!(Error::Aborted.code(), "EABORTED");
        assert_eq!(Error::Config("x".into()).code(), "ECONFIG");
        assert!(Error::PoolClosed.as_smtp().is_none());
        assert_eq!(Error::PoolClosed.response_code(), None);
    }
}
