//! Caller-supplied authentication handlers.

use std::fmt;

use async_trait::async_trait;

use super::Credentials;
use crate::command::Command;
use crate::connection::FramedStream;
use crate::error::{Error, Result};
use crate::types::{Capabilities, Reply};

/// A caller-registered SASL mechanism.
///
/// The handler drives the exchange through [`AuthContext::send_command`] and
/// reports the outcome with [`AuthContext::resolve`] or
/// [`AuthContext::reject`]. Returning `Ok(())` without either counts as
/// success; a returned error always wins.
#[async_trait]
pub trait CustomAuth: Send + Sync {
    /// Runs the exchange.
    async fn authenticate(&self, ctx: &mut AuthContext<'_>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Resolved,
    Rejected(String),
}

/// View of the connection handed to a [`CustomAuth`] handler.
pub struct AuthContext<'a> {
    framed: &'a mut FramedStream,
    capabilities: &'a Capabilities,
    credentials: Option<&'a Credentials>,
    method: &'a str,
    outcome: Option<Outcome>,
}

impl<'a> AuthContext<'a> {
    pub(crate) const fn new(
        framed: &'a mut FramedStream,
        capabilities: &'a Capabilities,
        credentials: Option<&'a Credentials>,
        method: &'a str,
    ) -> Self {
        Self {
            framed,
            capabilities,
            credentials,
            method,
            outcome: None,
        }
    }

    /// Sends one raw line (CRLF appended) and returns the server's reply.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, timeout or a malformed reply.
    pub async fn send_command(&mut self, line: &str) -> Result<Reply> {
        self.framed
            .send_command(&Command::Raw(line.to_string()))
            .await?;
        self.framed.read_reply().await
    }

    /// EHLO keywords the server advertised.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        self.capabilities.keywords()
    }

    /// AUTH mechanisms the server advertised.
    #[must_use]
    pub fn auth_methods(&self) -> Vec<String> {
        self.capabilities.auth_methods()
    }

    /// Configured credentials, if any.
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials
    }

    /// Name of the mechanism being run.
    #[must_use]
    pub const fn method(&self) -> &str {
        self.method
    }

    /// Marks the exchange as successful.
    pub fn resolve(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Resolved);
        }
    }

    /// Marks the exchange as failed.
    pub fn reject(&mut self, reason: impl Into<String>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Rejected(reason.into()));
        }
    }

    pub(crate) fn finish(self, result: Result<()>) -> Result<()> {
        result?;
        match self.outcome {
            Some(Outcome::Rejected(reason)) => Err(Error::auth(None, reason)),
            Some(Outcome::Resolved) | None => Ok(()),
        }
    }
}

impl fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("method", &self.method)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}
