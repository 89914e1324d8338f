//! SMTP command builder.

use std::fmt::Write as _;

use crate::types::{DsnReturn, xtext};

/// Optional parameters of `MAIL FROM`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParams {
    /// `SIZE=`
    pub size: Option<usize>,
    /// `BODY=` (`8BITMIME`)
    pub body: Option<&'static str>,
    /// `SMTPUTF8`
    pub smtp_utf8: bool,
    /// `RET=`
    pub ret: Option<DsnReturn>,
    /// `ENVID=`, plain text (xtext-encoded on serialization)
    pub envid: Option<String>,
}

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// LHLO - LMTP greeting
    Lhlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Mechanism name as sent on the wire
        mechanism: String,
        /// Initial response (optional, for SASL-IR)
        initial_response: Option<String>,
    },
    /// A SASL continuation line (base64, possibly empty)
    AuthResponse(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address, empty for the null reverse path
        from: String,
        /// Transaction parameters
        params: MailParams,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: String,
        /// `NOTIFY=` value
        notify: Option<String>,
        /// `ORCPT=` original recipient, plain text
        orcpt: Option<String>,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// Any other line, sent verbatim (custom auth handlers)
    Raw(String),
}

impl Command {
    /// Serializes the command to bytes, CRLF included.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut line = self.line();
        line.push_str("\r\n");
        line.into_bytes()
    }

    /// Returns the command line without CRLF.
    #[must_use]
    pub fn line(&self) -> String {
        match self {
            Self::Helo { hostname } => format!("HELO {hostname}"),
            Self::Ehlo { hostname } => format!("EHLO {hostname}"),
            Self::Lhlo { hostname } => format!("LHLO {hostname}"),
            Self::StartTls => "STARTTLS".to_string(),
            Self::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(resp) => format!("AUTH {mechanism} {resp}"),
                None => format!("AUTH {mechanism}"),
            },
            Self::AuthResponse(resp) => resp.clone(),
            Self::MailFrom { from, params } => {
                let mut line = format!("MAIL FROM:<{from}>");
                if let Some(body) = params.body {
                    let _ = write!(line, " BODY={body}");
                }
                if let Some(size) = params.size {
                    let _ = write!(line, " SIZE={size}");
                }
                if params.smtp_utf8 {
                    line.push_str(" SMTPUTF8");
                }
                if let Some(ret) = params.ret {
                    let _ = write!(line, " RET={}", ret.as_str());
                }
                if let Some(envid) = &params.envid {
                    let _ = write!(line, " ENVID={}", xtext(envid));
                }
                line
            }
            Self::RcptTo { to, notify, orcpt } => {
                let mut line = format!("RCPT TO:<{to}>");
                if let Some(notify) = notify {
                    let _ = write!(line, " NOTIFY={notify}");
                }
                if let Some(orcpt) = orcpt {
                    let _ = write!(line, " ORCPT=rfc822;{}", xtext(orcpt));
                }
                line
            }
            Self::Data => "DATA".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Noop => "NOOP".to_string(),
            Self::Quit => "QUIT".to_string(),
            Self::Raw(line) => line.clone(),
        }
    }

    /// Returns the command line safe for logs: SASL payloads are masked.
    #[must_use]
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {mechanism} <redacted>"),
            Self::AuthResponse(_) => "<redacted>".to_string(),
            Self::Raw(line) if line.to_uppercase().starts_with("AUTH ") => {
                let verb = line.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                format!("{verb} <redacted>")
            }
            _ => self.line(),
        }
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
    fn test_greetings() {
        let hostname = "client.example.com".to_string();
        assert_eq!(
            Command::Helo {
                hostname: hostname.clone()
            }
            .serialize(),
            b"HELO client.example.com\r\n"
        );
        assert_eq!(
            Command::Ehlo {
                hostname: hostname.clone()
            }
            .serialize(),
            b"EHLO client.example.com\r\n"
        );
        assert_eq!(
            Command::Lhlo { hostname }.serialize(),
            b"LHLO client.example.com\r\n"
        );
    }

    #[test]
    fn test_auth_plain() {
        let cmd = Command::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
        };
        assert_eq!(cmd.serialize(), b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
        assert_eq!(cmd.redacted(), "AUTH PLAIN <redacted>");
    }

    #[test]
    fn test_auth_response_is_redacted() {
        let cmd = Command::AuthResponse("c2VjcmV0".to_string());
        assert_eq!(cmd.serialize(), b"c2VjcmV0\r\n");
        assert_eq!(cmd.redacted(), "<redacted>");
        assert_eq!(
            Command::Raw("AUTH X-TOKEN abc".into()).redacted(),
            "AUTH X-TOKEN <redacted>"
        );
    }

    #[test]
    fn test_mail_from_simple() {
        let cmd = Command::MailFrom {
            from: "sender@example.com".to_string(),
            params: MailParams::default(),
        };
        assert_eq!(cmd.serialize(), b"MAIL FROM:<sender@example.com>\r\n");
    }

    #[test]
    fn test_mail_from_null_sender() {
        let cmd = Command::MailFrom {
            from: String::new(),
            params: MailParams::default(),
        };
        assert_eq!(cmd.serialize(), b"MAIL FROM:<>\r\n");
    }

    #[test]
    fn test_mail_from_with_params() {
        let cmd = Command::MailFrom {
            from: "sender@example.com".to_string(),
            params: MailParams {
                size: Some(12345),
                body: Some("8BITMIME"),
                smtp_utf8: true,
                ret: Some(DsnReturn::Headers),
                envid: Some("id 1".to_string()),
            },
        };
        assert_eq!(
            cmd.line(),
            "MAIL FROM:<sender@example.com> BODY=8BITMIME SIZE=12345 SMTPUTF8 RET=HDRS ENVID=id+201"
        );
    }

    #[test]
    fn test_rcpt_to_command() {
        let cmd = Command::RcptTo {
            to: "recipient@example.com".to_string(),
            notify: None,
            orcpt: None,
        };
        assert_eq!(cmd.serialize(), b"RCPT TO:<recipient@example.com>\r\n");
    }

    #[test]
    fn test_rcpt_to_with_dsn() {
        let cmd = Command::RcptTo {
            to: "r@example.com".to_string(),
            notify: Some("SUCCESS,FAILURE".to_string()),
            orcpt: Some("r+1@example.com".to_string()),
        };
        assert_eq!(
            cmd.line(),
            "RCPT TO:<r@example.com> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;r+2B1@example.com"
        );
    }

    #[test]
    fn test_simple_verbs() {
        assert_eq!(Command::StartTls.serialize(), b"STARTTLS\r\n");
        assert_eq!(Command::Data.serialize(), b"DATA\r\n");
        assert_eq!(Command::Rset.serialize(), b"RSET\r\n");
        assert_eq!(Command::Noop.serialize(), b"NOOP\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
    }
}
