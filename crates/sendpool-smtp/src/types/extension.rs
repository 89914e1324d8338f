//! SMTP extension types and the negotiated capability set.

use super::Reply;

/// SMTP extensions discovered from EHLO response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication, with the advertised mechanism names (uppercase)
    Auth(Vec<String>),
    /// SIZE - Maximum message size
    Size(Option<usize>),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// CHUNKING - Chunked message transfer
    Chunking,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// DSN - Delivery status notifications
    Dsn,
    /// ENHANCEDSTATUSCODES - RFC 3463 status codes in replies
    EnhancedStatusCodes,
    /// Unknown extension (keyword uppercased, parameters kept)
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from EHLO response.
    ///
    /// Accepts the legacy `AUTH=LOGIN PLAIN` form some servers still send.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(first) = parts.next() else {
            return Self::Unknown(line.to_string());
        };

        let keyword = first.to_uppercase();
        if let Some(legacy) = keyword.strip_prefix("AUTH=") {
            let mechanisms = std::iter::once(legacy.to_string())
                .chain(parts.map(str::to_uppercase))
                .filter(|m| !m.is_empty())
                .collect();
            return Self::Auth(mechanisms);
        }

        match keyword.as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth(parts.map(str::to_uppercase).collect()),
            "SIZE" => Self::Size(parts.next().and_then(|s| s.parse().ok())),
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "CHUNKING" => Self::Chunking,
            "SMTPUTF8" => Self::SmtpUtf8,
            "DSN" => Self::Dsn,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            _ => Self::Unknown(line.trim().to_string()),
        }
    }

    /// Returns the EHLO keyword of this extension.
    #[must_use]
    pub fn keyword(&self) -> &str {
        match self {
            Self::StartTls => "STARTTLS",
            Self::Auth(_) => "AUTH",
            Self::Size(_) => "SIZE",
            Self::EightBitMime => "8BITMIME",
            Self::Pipelining => "PIPELINING",
            Self::Chunking => "CHUNKING",
            Self::SmtpUtf8 => "SMTPUTF8",
            Self::Dsn => "DSN",
            Self::EnhancedStatusCodes => "ENHANCEDSTATUSCODES",
            Self::Unknown(line) => line.split_whitespace().next().unwrap_or(""),
        }
    }
}

/// Built-in SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
    /// `XOAUTH2` - `OAuth2` bearer token (Google/Microsoft)
    XOAuth2,
}

impl AuthMechanism {
    /// Automatic selection order, most preferred first.
    pub const PREFERENCE: [Self; 4] = [Self::CramMd5, Self::Login, Self::Plain, Self::XOAuth2];

    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
        }
    }
}

/// Server capabilities negotiated during the greeting exchange.
///
/// Built once from the EHLO (or LHLO) reply and never mutated afterwards; a
/// STARTTLS upgrade replaces the whole value with the post-TLS EHLO result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    hostname: String,
    extensions: Vec<Extension>,
    helo_fallback: bool,
}

impl Capabilities {
    /// Parses an EHLO reply; the first line is the server greeting, every
    /// following line advertises one extension.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let hostname = reply
            .first_line()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let extensions = reply
            .message
            .iter()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(|line| Extension::parse(line))
            .collect();

        Self {
            hostname,
            extensions,
            helo_fallback: false,
        }
    }

    /// Capabilities after a HELO fallback: nothing is advertised.
    #[must_use]
    pub fn from_helo(reply: &Reply) -> Self {
        Self {
            hostname: reply
                .first_line()
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
            extensions: Vec::new(),
            helo_fallback: true,
        }
    }

    /// Host name the server announced in its EHLO/HELO reply.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns every advertised extension.
    #[must_use]
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Returns the advertised EHLO keywords, uppercase.
    #[must_use]
    pub fn keywords(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|ext| ext.keyword().to_uppercase())
            .collect()
    }

    /// Returns true if these capabilities came from a HELO fallback.
    #[must_use]
    pub const fn is_helo_fallback(&self) -> bool {
        self.helo_fallback
    }

    /// Checks if the server supports an extension.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    /// Checks if PIPELINING is supported.
    #[must_use]
    pub fn supports_pipelining(&self) -> bool {
        self.supports(&Extension::Pipelining)
    }

    /// Checks if 8BITMIME is supported.
    #[must_use]
    pub fn supports_8bitmime(&self) -> bool {
        self.supports(&Extension::EightBitMime)
    }

    /// Checks if SMTPUTF8 is supported.
    #[must_use]
    pub fn supports_smtputf8(&self) -> bool {
        self.supports(&Extension::SmtpUtf8)
    }

    /// Checks if DSN is supported.
    #[must_use]
    pub fn supports_dsn(&self) -> bool {
        self.supports(&Extension::Dsn)
    }

    /// Checks if SIZE is advertised, with or without a limit.
    #[must_use]
    pub fn supports_size(&self) -> bool {
        self.extensions
            .iter()
            .any(|ext| matches!(ext, Extension::Size(_)))
    }

    /// Returns the maximum message size, if advertised and non-zero.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(Some(size)) if *size > 0 => Some(*size),
            _ => None,
        })
    }

    /// Returns the advertised AUTH mechanism names, merged across lines.
    #[must_use]
    pub fn auth_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = Vec::new();
        for ext in &self.extensions {
            if let Extension::Auth(names) = ext {
                for name in names {
                    if !methods.contains(name) {
                        methods.push(name.clone());
                    }
                }
            }
        }
        methods
    }

    /// Checks if a mechanism name is advertised.
    #[must_use]
    pub fn supports_auth(&self, name: &str) -> bool {
        let name = name.to_uppercase();
        self.auth_methods().iter().any(|m| *m == name)
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
    use crate::types::ReplyCode;

    fn ehlo(lines: &[&str]) -> Reply {
        Reply::new(
            ReplyCode::OK,
            lines.iter().map(ToString::to_string).collect(),
        )
    }

    mod extension_parse_tests {
        use super::*;

        #[test]
        fn keywords_are_case_insensitive() {
            assert_eq!(Extension::parse("starttls"), Extension::StartTls);
            assert_eq!(Extension::parse("Pipelining"), Extension::Pipelining);
        }

        #[test]
        fn auth_keeps_unknown_mechanisms() {
            assert_eq!(
                Extension::parse("AUTH plain LOGIN X-TOKEN"),
                Extension::Auth(vec!["PLAIN".into(), "LOGIN".into(), "X-TOKEN".into()])
            );
        }

        #[test]
        fn legacy_auth_equals_form() {
            assert_eq!(
                Extension::parse("AUTH=LOGIN PLAIN"),
                Extension::Auth(vec!["LOGIN".into(), "PLAIN".into()])
            );
        }

        #[test]
        fn size_with_and_without_limit() {
            assert_eq!(Extension::parse("SIZE 35882577"), Extension::Size(Some(35_882_577)));
            assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
        }

        #[test]
        fn unknown_keeps_line() {
            let ext = Extension::parse("X-EXPS GSSAPI NTLM");
            assert_eq!(ext, Extension::Unknown("X-EXPS GSSAPI NTLM".into()));
            assert_eq!(ext.keyword(), "X-EXPS");
        }

        #[test]
        fn empty_line() {
            assert!(matches!(Extension::parse(""), Extension::Unknown(_)));
        }
    }

    mod auth_mechanism_tests {
        use super::*;

        #[test]
        fn parse_names() {
            assert_eq!(AuthMechanism::parse("cram-md5"), Some(AuthMechanism::CramMd5));
            assert_eq!(AuthMechanism::parse("XOAUTH2"), Some(AuthMechanism::XOAuth2));
            assert_eq!(AuthMechanism::parse("GSSAPI"), None);
        }

        #[test]
        fn preference_order() {
            assert_eq!(
                AuthMechanism::PREFERENCE.map(AuthMechanism::as_str),
                ["CRAM-MD5", "LOGIN", "PLAIN", "XOAUTH2"]
            );
        }
    }

    mod capabilities_tests {
        use super::*;

        #[test]
        fn from_ehlo_reply() {
            let caps = Capabilities::from_ehlo(&ehlo(&[
                "mx.example.com greets client",
                "PIPELINING",
                "SIZE 1000",
                "8BITMIME",
                "AUTH PLAIN LOGIN",
                "AUTH=CRAM-MD5",
                "STARTTLS",
            ]));
            assert_eq!(caps.hostname(), "mx.example.com");
            assert!(caps.supports_pipelining());
            assert!(caps.supports_starttls());
            assert!(caps.supports_8bitmime());
            assert!(!caps.supports_smtputf8());
            assert_eq!(caps.max_message_size(), Some(1000));
            assert_eq!(caps.auth_methods(), vec!["PLAIN", "LOGIN", "CRAM-MD5"]);
            assert!(caps.supports_auth("cram-md5"));
            assert!(!caps.is_helo_fallback());
        }

        #[test]
        fn zero_size_means_no_limit() {
            let caps = Capabilities::from_ehlo(&ehlo(&["mx", "SIZE 0"]));
            assert!(caps.supports_size());
            assert_eq!(caps.max_message_size(), None);
        }

        #[test]
        fn helo_fallback_is_empty() {
            let caps = Capabilities::from_helo(&ehlo(&["mx.example.com"]));
            assert!(caps.is_helo_fallback());
            assert!(caps.extensions().is_empty());
            assert!(caps.auth_methods().is_empty());
            assert!(!caps.supports_pipelining());
        }

        #[test]
        fn keywords_list() {
            let caps = Capabilities::from_ehlo(&ehlo(&["mx", "DSN", "x-custom 1"]));
            assert_eq!(caps.keywords(), vec!["DSN", "X-CUSTOM"]);
        }
    }
}
