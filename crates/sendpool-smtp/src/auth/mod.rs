//! SMTP authentication.
//!
//! Mechanism choice follows a fixed order: an explicit override (built-in or
//! a registered custom handler), otherwise the first of
//! [`AuthMechanism::PREFERENCE`] that the server advertises and the
//! credentials can serve.

mod custom;
pub mod sasl;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

pub use custom::{AuthContext, CustomAuth};

use crate::command::Command;
use crate::connection::FramedStream;
use crate::error::{Error, Result};
use crate::types::{AuthMechanism, Capabilities, Reply, ReplyCode};

/// Registered custom handlers, keyed by uppercase mechanism name.
pub type CustomAuthMap = HashMap<String, Arc<dyn CustomAuth>>;

/// Authentication credentials.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    pass: Option<SecretString>,
    access_token: Option<SecretString>,
}

impl Credentials {
    /// Username and password.
    #[must_use]
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: Some(SecretString::new(pass.into())),
            access_token: None,
        }
    }

    /// Username and `OAuth2` access token, for XOAUTH2.
    #[must_use]
    pub fn xoauth2(user: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: None,
            access_token: Some(SecretString::new(access_token.into())),
        }
    }

    /// Username only; for custom handlers that obtain secrets elsewhere.
    #[must_use]
    pub fn user_only(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: None,
            access_token: None,
        }
    }

    /// Returns the username.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the password, if any.
    #[must_use]
    pub const fn password(&self) -> Option<&SecretString> {
        self.pass.as_ref()
    }

    /// Returns the access token, if any.
    #[must_use]
    pub const fn access_token(&self) -> Option<&SecretString> {
        self.access_token.as_ref()
    }

    fn can_use(&self, mechanism: AuthMechanism) -> bool {
        match mechanism {
            AuthMechanism::Plain | AuthMechanism::Login | AuthMechanism::CramMd5 => {
                self.pass.is_some()
            }
            AuthMechanism::XOAuth2 => self.access_token.is_some(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// The mechanism a connection will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// AUTH PLAIN with initial response.
    Plain,
    /// AUTH LOGIN, username and password in two round-trips.
    Login,
    /// AUTH CRAM-MD5 challenge/response.
    CramMd5,
    /// AUTH XOAUTH2 bearer token.
    XOAuth2,
    /// A registered [`CustomAuth`] handler.
    Custom(String),
}

impl AuthStrategy {
    /// Returns the mechanism name as sent on the wire.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Plain => AuthMechanism::Plain.as_str(),
            Self::Login => AuthMechanism::Login.as_str(),
            Self::CramMd5 => AuthMechanism::CramMd5.as_str(),
            Self::XOAuth2 => AuthMechanism::XOAuth2.as_str(),
            Self::Custom(name) => name,
        }
    }

    /// Picks the mechanism to run.
    ///
    /// An override is honored even if the server does not advertise it (a
    /// HELO-only server may still accept AUTH).
    ///
    /// # Errors
    ///
    /// Returns an authentication error for an unknown override, or when no
    /// advertised mechanism fits the credentials.
    pub fn select(
        capabilities: &Capabilities,
        credentials: Option<&Credentials>,
        method: Option<&str>,
        custom: &CustomAuthMap,
    ) -> Result<Self> {
        if let Some(method) = method {
            let name = method.trim().to_uppercase();
            if custom.contains_key(&name) {
                return Ok(Self::Custom(name));
            }
            return AuthMechanism::parse(&name)
                .map(Self::from)
                .ok_or_else(|| Error::auth(None, format!("Unknown authentication method {method}")));
        }

        if let Some(credentials) = credentials {
            for mechanism in AuthMechanism::PREFERENCE {
                if capabilities.supports_auth(mechanism.as_str()) && credentials.can_use(mechanism)
                {
                    return Ok(mechanism.into());
                }
            }
        }

        if let Some(name) = capabilities
            .auth_methods()
            .into_iter()
            .find(|name| custom.contains_key(name))
        {
            return Ok(Self::Custom(name));
        }

        Err(Error::auth(
            None,
            if capabilities.auth_methods().is_empty() {
                "Server does not advertise AUTH".to_string()
            } else {
                format!(
                    "No supported authentication method among {}",
                    capabilities.auth_methods().join(", ")
                )
            },
        ))
    }
}

impl From<AuthMechanism> for AuthStrategy {
    fn from(mechanism: AuthMechanism) -> Self {
        match mechanism {
            AuthMechanism::Plain => Self::Plain,
            AuthMechanism::Login => Self::Login,
            AuthMechanism::CramMd5 => Self::CramMd5,
            AuthMechanism::XOAuth2 => Self::XOAuth2,
        }
    }
}

/// Runs the chosen mechanism over the connection.
pub(crate) async fn authenticate(
    framed: &mut FramedStream,
    strategy: &AuthStrategy,
    capabilities: &Capabilities,
    credentials: Option<&Credentials>,
    custom: &CustomAuthMap,
) -> Result<()> {
    debug!(mechanism = strategy.name(), "authenticating");

    let mechanism = match strategy {
        AuthStrategy::Custom(name) => {
            let handler = custom
                .get(name)
                .ok_or_else(|| Error::auth(None, format!("No handler registered for {name}")))?;
            let mut ctx = AuthContext::new(framed, capabilities, credentials, name);
            let result = handler.authenticate(&mut ctx).await;
            return ctx.finish(result);
        }
        AuthStrategy::Plain => AuthMechanism::Plain,
        AuthStrategy::Login => AuthMechanism::Login,
        AuthStrategy::CramMd5 => AuthMechanism::CramMd5,
        AuthStrategy::XOAuth2 => AuthMechanism::XOAuth2,
    };

    let credentials =
        credentials.ok_or_else(|| Error::auth(None, "No credentials configured"))?;
    let user = credentials.user();

    match mechanism {
        AuthMechanism::Plain => {
            let pass = require_pass(credentials)?;
            let reply = auth_command(
                framed,
                "PLAIN",
                Some(sasl::plain_response(user, pass.expose_secret())),
            )
            .await?;
            finish(&reply)
        }
        AuthMechanism::Login => {
            let pass = require_pass(credentials)?;
            let reply = auth_command(framed, "LOGIN", None).await?;
            expect_continue(&reply)?;
            let reply = respond(framed, sasl::login_response(user)).await?;
            expect_continue(&reply)?;
            let reply = respond(framed, sasl::login_response(pass.expose_secret())).await?;
            finish(&reply)
        }
        AuthMechanism::CramMd5 => {
            let pass = require_pass(credentials)?;
            let reply = auth_command(framed, "CRAM-MD5", None).await?;
            expect_continue(&reply)?;
            match sasl::cram_md5_response(reply.first_line(), user, pass.expose_secret()) {
                Ok(answer) => finish(&respond(framed, answer).await?),
                Err(err) => {
                    // Cancel the exchange so the dialogue stays in sync.
                    respond(framed, "*".to_string()).await?;
                    Err(err)
                }
            }
        }
        AuthMechanism::XOAuth2 => {
            let token = credentials
                .access_token()
                .ok_or_else(|| Error::auth(None, "XOAUTH2 requires an access token"))?;
            let reply = auth_command(
                framed,
                "XOAUTH2",
                Some(sasl::xoauth2_response(user, token.expose_secret())),
            )
            .await?;
            if reply.code == ReplyCode::AUTH_CONTINUE {
                // The challenge carries a JSON error; an empty line ends the exchange.
                let detail = sasl::decode_challenge(reply.first_line());
                let reply = respond(framed, String::new()).await?;
                return Err(Error::auth(
                    Some(reply.code.as_u16()),
                    format!("{} ({detail})", reply.message_text()),
                ));
            }
            finish(&reply)
        }
    }
}

fn require_pass(credentials: &Credentials) -> Result<&SecretString> {
    credentials
        .password()
        .ok_or_else(|| Error::auth(None, "Password required"))
}

async fn auth_command(
    framed: &mut FramedStream,
    mechanism: &str,
    initial_response: Option<String>,
) -> Result<Reply> {
    framed
        .send_command(&Command::Auth {
            mechanism: mechanism.to_string(),
            initial_response,
        })
        .await?;
    framed.read_reply().await
}

async fn respond(framed: &mut FramedStream, payload: String) -> Result<Reply> {
    framed
        .send_command(&Command::AuthResponse(payload))
        .await?;
    framed.read_reply().await
}

fn expect_continue(reply: &Reply) -> Result<()> {
    if reply.code == ReplyCode::AUTH_CONTINUE {
        Ok(())
    } else {
        Err(rejected(reply))
    }
}

fn finish(reply: &Reply) -> Result<()> {
    if reply.is_success() {
        Ok(())
    } else {
        Err(rejected(reply))
    }
}

fn rejected(reply: &Reply) -> Error {
    Error::auth(Some(reply.code.as_u16()), reply.message_text())
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

    struct Noop;

    #[async_trait::async_trait]
    impl CustomAuth for Noop {
        async fn authenticate(&self, ctx: &mut AuthContext<'_>) -> Result<()> {
            ctx.resolve();
            Ok(())
        }
    }

    fn caps(auth: &str) -> Capabilities {
        let lines = vec!["mx.example.com".to_string(), format!("AUTH {auth}")];
        Capabilities::from_ehlo(&Reply::new(ReplyCode::OK, lines))
    }

    fn password() -> Credentials {
        Credentials::new("user", "secret")
    }

    #[test]
    fn test_preference_order() {
        let map = CustomAuthMap::new();
        let creds = password();
        assert_eq!(
            AuthStrategy::select(&caps("PLAIN LOGIN CRAM-MD5"), Some(&creds), None, &map).unwrap(),
            AuthStrategy::CramMd5
        );
        assert_eq!(
            AuthStrategy::select(&caps("PLAIN LOGIN"), Some(&creds), None, &map).unwrap(),
            AuthStrategy::Login
        );
        assert_eq!(
            AuthStrategy::select(&caps("XOAUTH2 PLAIN"), Some(&creds), None, &map).unwrap(),
            AuthStrategy::Plain
        );
    }

    #[test]
    fn test_token_credentials_pick_xoauth2() {
        let map = CustomAuthMap::new();
        let creds = Credentials::xoauth2("user", "token");
        assert_eq!(
            AuthStrategy::select(&caps("PLAIN XOAUTH2"), Some(&creds), None, &map).unwrap(),
            AuthStrategy::XOAuth2
        );
    }

    #[test]
    fn test_override_wins_even_if_not_advertised() {
        let map = CustomAuthMap::new();
        let creds = password();
        let empty = Capabilities::default();
        assert_eq!(
            AuthStrategy::select(&empty, Some(&creds), Some("login"), &map).unwrap(),
            AuthStrategy::Login
        );
    }

    #[test]
    fn test_unknown_override() {
        let map = CustomAuthMap::new();
        let err = AuthStrategy::select(&caps("PLAIN"), Some(&password()), Some("NTLM"), &map)
            .unwrap_err();
        assert_eq!(err.code(), "EAUTH");
    }

    #[test]
    fn test_custom_override_and_advertised_custom() {
        let mut map = CustomAuthMap::new();
        map.insert("X-TOKEN".to_string(), Arc::new(Noop) as Arc<dyn CustomAuth>);

        assert_eq!(
            AuthStrategy::select(&caps("PLAIN"), None, Some("x-token"), &map).unwrap(),
            AuthStrategy::Custom("X-TOKEN".into())
        );
        assert_eq!(
            AuthStrategy::select(&caps("X-TOKEN"), Some(&password()), None, &map).unwrap(),
            AuthStrategy::Custom("X-TOKEN".into())
        );
    }

    #[test]
    fn test_nothing_advertised() {
        let map = CustomAuthMap::new();
        let err = AuthStrategy::select(&Capabilities::default(), Some(&password()), None, &map)
            .unwrap_err();
        assert!(err.to_string().contains("does not advertise AUTH"));
    }

    #[test]
    fn test_debug_redacts() {
        let rendered = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }
}
