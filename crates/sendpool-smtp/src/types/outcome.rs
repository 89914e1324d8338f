//! Results of a mail transaction.

use std::fmt;
use std::time::Duration;

use super::Reply;

/// Why a single recipient was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientError {
    /// Recipient address as given in the envelope.
    pub recipient: String,
    /// Server reply code, `None` when rejected locally.
    pub code: Option<u16>,
    /// Server response text or local reason.
    pub message: String,
}

impl RecipientError {
    /// A recipient rejected before reaching the wire.
    #[must_use]
    pub fn local(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            code: None,
            message: message.into(),
        }
    }

    /// A recipient rejected by the server.
    #[must_use]
    pub fn from_reply(recipient: impl Into<String>, reply: &Reply) -> Self {
        Self {
            recipient: recipient.into(),
            code: Some(reply.code.as_u16()),
            message: reply.message_text(),
        }
    }
}

impl fmt::Display for RecipientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {code} {}", self.recipient, self.message),
            None => write!(f, "{}: {}", self.recipient, self.message),
        }
    }
}

/// Outcome of a successful send.
///
/// Partially rejected envelopes still succeed; the rejections are listed
/// here rather than raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendInfo {
    /// Recipients the server accepted.
    pub accepted: Vec<String>,
    /// Recipients rejected locally or by the server.
    pub rejected: Vec<String>,
    /// One entry per rejected recipient, in the same order.
    pub rejected_errors: Vec<RecipientError>,
    /// Time spent on MAIL FROM and RCPT TO.
    pub envelope_time: Duration,
    /// Time spent from DATA to the final reply.
    pub message_time: Duration,
    /// Body bytes written, after dot-stuffing.
    pub message_size: usize,
    /// Final server response (`250 2.0.0 Ok: queued as ...`).
    pub response: String,
    /// Message id supplied with the mail, if any.
    pub message_id: Option<String>,
    /// Id of the connection that carried the message.
    pub connection_id: u64,
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
    use crate::types::ReplyCode;

    #[test]
    fn test_local_rejection() {
        let err = RecipientError::local("bad", "Address must contain @");
        assert_eq!(err.code, None);
        assert_eq!(err.to_string(), "bad: Address must contain @");
    }

    #[test]
    fn test_server_rejection() {
        let reply = Reply::new(
            ReplyCode::MAILBOX_UNAVAILABLE,
            vec!["5.1.1 No such user".to_string()],
        );
        let err = RecipientError::from_reply("x@example.com", &reply);
        assert_eq!(err.code, Some(550));
        assert_eq!(err.to_string(), "x@example.com: 550 5.1.1 No such user");
    }
}
