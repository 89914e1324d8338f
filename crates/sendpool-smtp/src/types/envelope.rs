//! SMTP envelope and delivery status notification parameters.

use std::collections::HashSet;
use std::fmt;

/// Return mode for a delivery status notification (`RET=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnReturn {
    /// Return the full message.
    Full,
    /// Return headers only.
    Headers,
}

impl DsnReturn {
    /// Returns the parameter value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Headers => "HDRS",
        }
    }
}

/// Condition that triggers a delivery status notification (`NOTIFY=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnNotify {
    /// Never notify. Excludes every other condition.
    Never,
    /// Notify on successful delivery.
    Success,
    /// Notify on failure.
    Failure,
    /// Notify on delay.
    Delay,
}

impl DsnNotify {
    /// Returns the parameter value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Delay => "DELAY",
        }
    }
}

/// Delivery status notification request (RFC 3461).
///
/// Only sent when the server advertises `DSN`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dsn {
    /// `RET=` on MAIL FROM.
    pub ret: Option<DsnReturn>,
    /// `ENVID=` on MAIL FROM, xtext-encoded on the wire.
    pub envid: Option<String>,
    /// `NOTIFY=` on every RCPT TO.
    pub notify: Vec<DsnNotify>,
    /// `ORCPT=rfc822;` on every RCPT TO, xtext-encoded on the wire.
    pub orcpt: Option<String>,
}

impl Dsn {
    /// Renders the `NOTIFY=` value, or `None` when nothing was requested.
    ///
    /// `NEVER` wins over any other condition.
    #[must_use]
    pub fn notify_param(&self) -> Option<String> {
        if self.notify.is_empty() {
            return None;
        }
        if self.notify.contains(&DsnNotify::Never) {
            return Some(DsnNotify::Never.as_str().to_string());
        }
        let mut values: Vec<&str> = Vec::new();
        for notify in &self.notify {
            if !values.contains(&notify.as_str()) {
                values.push(notify.as_str());
            }
        }
        Some(values.join(","))
    }
}

/// Encodes a value as RFC 3461 xtext.
#[must_use]
pub fn xtext(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if (33..=126).contains(&byte) && byte != b'+' && byte != b'=' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("+{byte:02X}"));
        }
    }
    out
}

/// SMTP envelope: reverse path, forward paths and transaction parameters.
///
/// Addresses are kept as given and validated per send, so one malformed
/// recipient is reported instead of failing the whole envelope up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path. Empty means the null sender `<>`.
    pub from: String,
    /// Forward paths, in the order they are sent.
    pub to: Vec<String>,
    /// Declared message size in bytes.
    pub size: Option<usize>,
    /// Request `BODY=8BITMIME`.
    pub use_8bit: bool,
    /// Request `SMTPUTF8`. Set automatically for non-ASCII addresses.
    pub smtp_utf8: bool,
    /// Delivery status notification request.
    pub dsn: Option<Dsn>,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new<I, S>(from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Creates an envelope builder.
    #[must_use]
    pub fn builder(from: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(from)
    }

    /// Returns recipients with duplicates removed, first occurrence kept.
    ///
    /// Comparison is case-insensitive on the domain only.
    #[must_use]
    pub fn unique_recipients(&self) -> Vec<&str> {
        let mut seen = HashSet::with_capacity(self.to.len());
        self.to
            .iter()
            .filter(|rcpt| seen.insert(normalize(rcpt)))
            .map(String::as_str)
            .collect()
    }

    /// Returns true if any address needs SMTPUTF8.
    #[must_use]
    pub fn has_non_ascii_address(&self) -> bool {
        !self.from.is_ascii() || self.to.iter().any(|r| !r.is_ascii())
    }
}

fn normalize(addr: &str) -> String {
    let addr = addr.trim();
    match addr.rsplit_once('@') {
        Some((local, domain)) => format!("{local}@{}", domain.to_lowercase()),
        None => addr.to_string(),
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> -> [{}]", self.from, self.to.join(", "))
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    /// Creates a new builder with the given sender.
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            envelope: Envelope {
                from: from.into(),
                ..Envelope::default()
            },
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, rcpt: impl Into<String>) -> Self {
        self.envelope.to.push(rcpt.into());
        self
    }

    /// Declares the message size.
    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.envelope.size = Some(size);
        self
    }

    /// Requests `BODY=8BITMIME`.
    #[must_use]
    pub const fn use_8bit(mut self, enabled: bool) -> Self {
        self.envelope.use_8bit = enabled;
        self
    }

    /// Requests `SMTPUTF8`.
    #[must_use]
    pub const fn smtp_utf8(mut self, enabled: bool) -> Self {
        self.envelope.smtp_utf8 = enabled;
        self
    }

    /// Requests delivery status notifications.
    #[must_use]
    pub fn dsn(mut self, dsn: Dsn) -> Self {
        self.envelope.dsn = Some(dsn);
        self
    }

    /// Builds the envelope.
    #[must_use]
    pub fn build(self) -> Envelope {
        self.envelope
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
    fn test_builder() {
        let env = Envelope::builder("a@example.com")
            .to("b@example.com")
            .to("c@example.com")
            .size(1024)
            .use_8bit(true)
            .build();
        assert_eq!(env.from, "a@example.com");
        assert_eq!(env.to, vec!["b@example.com", "c@example.com"]);
        assert_eq!(env.size, Some(1024));
        assert!(env.use_8bit);
        assert!(!env.smtp_utf8);
    }

    #[test]
    fn test_unique_recipients() {
        let env = Envelope::new(
            "a@example.com",
            ["b@example.com", "b@EXAMPLE.com", "B@example.com", "c@x.org"],
        );
        assert_eq!(
            env.unique_recipients(),
            vec!["b@example.com", "B@example.com", "c@x.org"]
        );
    }

    #[test]
    fn test_unique_recipients_large_list_keeps_first_seen_order() {
        let mut to: Vec<String> = (0..500).map(|i| format!("user{i}@example.com")).collect();
        to.extend((0..500).rev().map(|i| format!("user{i}@EXAMPLE.COM")));
        let env = Envelope::new("a@example.com", to);

        let unique = env.unique_recipients();
        assert_eq!(unique.len(), 500);
        assert_eq!(unique[0], "user0@example.com");
        assert_eq!(unique[499], "user499@example.com");
    }

    #[test]
    fn test_non_ascii_detection() {
        assert!(!Envelope::new("a@example.com", ["b@example.com"]).has_non_ascii_address());
        assert!(Envelope::new("a@example.com", ["jörg@example.de"]).has_non_ascii_address());
    }

    #[test]
    fn test_xtext() {
        assert_eq!(xtext("abc"), "abc");
        assert_eq!(xtext("a+b=c d"), "a+2Bb+3Dc+20d");
    }

    #[test]
    fn test_notify_param() {
        let dsn = Dsn {
            notify: vec![DsnNotify::Failure, DsnNotify::Delay, DsnNotify::Failure],
            ..Dsn::default()
        };
        assert_eq!(dsn.notify_param().as_deref(), Some("FAILURE,DELAY"));

        let never = Dsn {
            notify: vec![DsnNotify::Success, DsnNotify::Never],
            ..Dsn::default()
        };
        assert_eq!(never.notify_param().as_deref(), Some("NEVER"));
        assert_eq!(Dsn::default().notify_param(), None);
    }

    #[test]
    fn test_display() {
        let env = Envelope::new("", ["b@example.com"]);
        assert_eq!(env.to_string(), "<> -> [b@example.com]");
    }
}
