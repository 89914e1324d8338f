//! Error types for SMTP operations.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::types::RecipientError;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of the dialogue during which a timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Opening the socket (and the implicit TLS handshake).
    Connect,
    /// Waiting for the `220` greeting.
    Greeting,
    /// Waiting for any byte from the peer, or for a write to drain.
    Socket,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connecting",
            Self::Greeting => "waiting for greeting",
            Self::Socket => "waiting for server activity",
        })
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket failure or unexpected close.
    Connection,
    /// No activity within the configured budget.
    Timeout,
    /// TLS handshake failure, or STARTTLS required but unavailable.
    Tls,
    /// Mechanism exhausted or credentials rejected.
    Auth,
    /// Sender rejected, or every recipient rejected.
    Envelope,
    /// Message refused (size limit, DATA rejected, final status).
    Message,
    /// The message byte source failed mid-DATA.
    MessageStream,
    /// Malformed reply or a protocol violation on our side.
    Protocol,
    /// Operation issued in the wrong connection state.
    InvalidState,
}

impl ErrorKind {
    /// Returns the stable string code for this kind.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Connection => "ECONNECTION",
            Self::Timeout => "ETIMEDOUT",
            Self::Tls => "ETLS",
            Self::Auth => "EAUTH",
            Self::Envelope => "EENVELOPE",
            Self::Message => "EMESSAGE",
            Self::MessageStream => "ESTREAM",
            Self::Protocol => "EPROTOCOL",
            Self::InvalidState => "EINVALIDSTATE",
        }
    }
}

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Host name not usable as a TLS server name.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// STARTTLS was required but could not be negotiated.
    #[error("TLS required but {0}")]
    TlsRequired(String),

    /// The server answered STARTTLS with something other than `220`.
    #[error("STARTTLS refused {code}: {message}")]
    StartTlsRefused {
        /// Reply code of the refusal.
        code: u16,
        /// Server response text.
        message: String,
    },

    /// The peer closed the connection.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// A timer fired.
    #[error("Timed out after {after:?} while {phase}")]
    Timeout {
        /// Phase during which the timer fired.
        phase: TimeoutPhase,
        /// Configured budget.
        after: Duration,
    },

    /// Server returned an unexpected reply outside a mail transaction
    /// (greeting, HELO, STARTTLS, unsolicited reply).
    #[error("SMTP error {code}: {message}")]
    SmtpError {
        /// Reply code (e.g., 421).
        code: u16,
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Reply code of the terminal server response, if any.
        code: Option<u16>,
        /// Server response text or local reason.
        message: String,
    },

    /// Sender rejected or no recipient accepted.
    #[error("Envelope rejected: {message}")]
    Envelope {
        /// Reply code of the server response, if any.
        code: Option<u16>,
        /// Server response text or local reason.
        message: String,
        /// Per-recipient rejections collected so far.
        rejected: Vec<RecipientError>,
    },

    /// Message refused by the server or by a local limit.
    #[error("Message rejected: {message}")]
    Message {
        /// Reply code of the server response, if any.
        code: Option<u16>,
        /// Server response text or local reason.
        message: String,
    },

    /// The message source failed while streaming DATA.
    #[error("Message source failed after {bytes_sent} bytes: {source}")]
    MessageStream {
        /// Error returned by the source.
        #[source]
        source: io::Error,
        /// Body bytes already written to the socket.
        bytes_sent: usize,
    },

    /// Protocol error (malformed reply, 8-bit body without 8BITMIME).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::SmtpError {
            code,
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn auth(code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    /// Creates a message error.
    #[must_use]
    pub fn message(code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Message {
            code,
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::SmtpError { .. } => ErrorKind::Connection,
            Self::Tls(_)
            | Self::InvalidDnsName(_)
            | Self::TlsRequired(_)
            | Self::StartTlsRefused { .. } => ErrorKind::Tls,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Envelope { .. } | Self::InvalidAddress(_) => ErrorKind::Envelope,
            Self::Message { .. } => ErrorKind::Message,
            Self::MessageStream { .. } => ErrorKind::MessageStream,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Returns the stable string code (`ECONNECTION`, `EAUTH`, ...).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Returns the server reply code attached to this error, if any.
    #[must_use]
    pub const fn response_code(&self) -> Option<u16> {
        match self {
            Self::SmtpError { code, .. } | Self::StartTlsRefused { code, .. } => Some(*code),
            Self::Auth { code, .. } | Self::Envelope { code, .. } | Self::Message { code, .. } => {
                *code
            }
            _ => None,
        }
    }

    /// Returns the server response text attached to this error, if any.
    #[must_use]
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::SmtpError { message, .. } | Self::StartTlsRefused { message, .. } => {
                Some(message)
            }
            Self::Auth { code, message }
            | Self::Envelope { code, message, .. }
            | Self::Message { code, message } => code.map(|_| message.as_str()),
            _ => None,
        }
    }

    /// Returns the per-recipient rejections of an envelope error.
    #[must_use]
    pub fn rejected(&self) -> &[RecipientError] {
        match self {
            Self::Envelope { rejected, .. } => rejected,
            _ => &[],
        }
    }

    /// Returns true if the connection cannot be used after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::InvalidDnsName(_)
                | Self::TlsRequired(_)
                | Self::StartTlsRefused { .. }
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::SmtpError { .. }
                | Self::MessageStream { .. }
                | Self::Protocol(_)
        )
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.response_code(), Some(code) if code >= 500 && code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.response_code(), Some(code) if code >= 400 && code < 500)
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
    fn codes_follow_kind() {
        assert_eq!(Error::ConnectionClosed.code(), "ECONNECTION");
        assert_eq!(Error::auth(Some(535), "bad").code(), "EAUTH");
        assert_eq!(
            Error::Timeout {
                phase: TimeoutPhase::Greeting,
                after: Duration::from_secs(1)
            }
            .code(),
            "ETIMEDOUT"
        );
        assert_eq!(Error::TlsRequired("no STARTTLS".into()).code(), "ETLS");
        let refused = Error::StartTlsRefused {
            code: 454,
            message: "4.7.0 TLS not available".into(),
        };
        assert_eq!(refused.code(), "ETLS");
        assert_eq!(refused.response_code(), Some(454));
        assert!(refused.is_transient());
        assert_eq!(Error::InvalidAddress("x".into()).code(), "EENVELOPE");
    }

    #[test]
    fn response_only_when_server_replied() {
        let err = Error::message(Some(552), "too big");
        assert_eq!(err.response_code(), Some(552));
        assert_eq!(err.response(), Some("too big"));
        assert!(err.is_permanent());

        let local = Error::message(None, "exceeds advertised SIZE");
        assert_eq!(local.response_code(), None);
        assert_eq!(local.response(), None);
        assert!(!local.is_permanent());
    }

    #[test]
    fn envelope_errors_expose_rejections() {
        let err = Error::Envelope {
            code: Some(550),
            message: "all recipients were rejected".into(),
            rejected: vec![RecipientError::local("bad@", "missing domain")],
        };
        assert_eq!(err.rejected().len(), 1);
        assert!(!err.is_fatal());
        assert!(Error::ConnectionClosed.rejected().is_empty());
    }

    #[test]
    fn transport_failures_are_fatal() {
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::Protocol("8-bit".into()).is_fatal());
        assert!(!Error::auth(Some(535), "no").is_fatal());
        assert!(Error::smtp_error(421, "shutting down").is_transient());
    }

    #[test]
    fn timeout_display_names_phase() {
        let err = Error::Timeout {
            phase: TimeoutPhase::Socket,
            after: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5s while waiting for server activity"
        );
    }
}
