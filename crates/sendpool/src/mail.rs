//! A message ready for delivery: envelope, message id and byte source.

use std::fmt;
use std::io::Cursor;

use sendpool_smtp::Envelope;
use tokio::io::AsyncRead;

/// Readable message body, streamed into DATA.
pub type MessageSource = Box<dyn AsyncRead + Send + Unpin>;

/// One message to send.
///
/// The body is an already-built RFC 5322 byte stream; it is read once, in
/// bounded chunks, while the DATA phase runs.
pub struct Mail {
    envelope: Envelope,
    message_id: Option<String>,
    source: MessageSource,
}

impl Mail {
    /// Creates a mail streaming its body from `source`.
    #[must_use]
    pub fn new(envelope: Envelope, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            envelope,
            message_id: None,
            source: Box::new(source),
        }
    }

    /// Creates a mail from an in-memory body.
    #[must_use]
    pub fn from_bytes(envelope: Envelope, body: impl Into<Vec<u8>>) -> Self {
        Self::new(envelope, Cursor::new(body.into()))
    }

    /// Attaches the message id reported back in
    /// [`SendInfo::message_id`](sendpool_smtp::SendInfo::message_id).
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Returns the envelope.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Returns the message id, if set.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Splits the mail into envelope, message id and body source.
    #[must_use]
    pub fn into_parts(self) -> (Envelope, Option<String>, MessageSource) {
        (self.envelope, self.message_id, self.source)
    }
}

impl fmt::Debug for Mail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mail")
            .field("envelope", &self.envelope)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
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
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn from_bytes_streams_body() {
        let envelope = Envelope::new("a@example.org", ["b@example.org"]);
        let mail = Mail::from_bytes(envelope, "Subject: hi\r\n\r\nbody\r\n")
            .with_message_id("<1@example.org>");
        assert_eq!(mail.message_id(), Some("<1@example.org>"));
        assert_eq!(mail.envelope().to, vec!["b@example.org".to_string()]);

        let (envelope, message_id, mut source) = mail.into_parts();
        let mut body = String::new();
        source.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "Subject: hi\r\n\r\nbody\r\n");
        assert_eq!(envelope.from, "a@example.org");
        assert_eq!(message_id.as_deref(), Some("<1@example.org>"));
    }

    #[test]
    fn debug_omits_body() {
        let mail = Mail::from_bytes(Envelope::new("a@example.org", ["b@example.org"]), "secret");
        let rendered = format!("{mail:?}");
        assert!(!rendered.contains("secret"));
    }
}
