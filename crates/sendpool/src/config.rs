//! Transport configuration.

use std::sync::Arc;
use std::time::Duration;

use sendpool_smtp::{ConnectionOptions, Credentials, CustomAuth, SocketProvider};

use crate::error::{Error, Result};
use crate::services::{self, Service};

/// Default live connections per pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// Default messages per connection before it is recycled.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Default rate-limit window.
pub const DEFAULT_RATE_DELTA: Duration = Duration::from_secs(1);

/// Transport settings: the connection options plus pool sizing.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Options every connection is created with.
    pub connection: ConnectionOptions,
    /// Reuse connections through a [`Pool`](crate::Pool); otherwise every
    /// send opens and closes its own connection.
    pub pool: bool,
    /// Upper bound on live pooled connections.
    pub max_connections: usize,
    /// Messages per connection before it is replaced.
    pub max_messages: usize,
    /// Dispatches allowed per `rate_delta`, pool-wide. `None` is unlimited.
    pub rate_limit: Option<usize>,
    /// Rate-limit window.
    pub rate_delta: Duration,
}

impl TransportConfig {
    /// Creates a pooled configuration for `host` with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            connection: ConnectionOptions::new(host),
            pool: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_messages: DEFAULT_MAX_MESSAGES,
            rate_limit: None,
            rate_delta: DEFAULT_RATE_DELTA,
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Returns the options for one connection.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        self.connection.clone()
    }

    /// Checks the pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty host, zero sizing or a zero
    /// rate window.
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(Error::Config("host is required".to_string()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.max_messages == 0 {
            return Err(Error::Config("max_messages must be at least 1".to_string()));
        }
        if self.rate_limit == Some(0) {
            return Err(Error::Config("rate_limit must be at least 1".to_string()));
        }
        if self.rate_limit.is_some() && self.rate_delta.is_zero() {
            return Err(Error::Config("rate_delta must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`TransportConfig`].
///
/// `service` fills in host, port and TLS mode from [`services::lookup`];
/// an explicit `host`, `port` or `secure` wins over it.
#[derive(Debug, Clone)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
    service: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    secure: Option<bool>,
}

impl TransportConfigBuilder {
    /// Creates a builder with default settings and no host.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: TransportConfig::new(""),
            service: None,
            host: None,
            port: None,
            secure: None,
        }
    }

    /// Uses a well-known service's endpoint.
    #[must_use]
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    /// Sets the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the server port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables implicit TLS.
    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Never issue STARTTLS.
    #[must_use]
    pub const fn ignore_tls(mut self, ignore: bool) -> Self {
        self.config.connection.ignore_tls = ignore;
        self
    }

    /// Require an encrypted session.
    #[must_use]
    pub const fn require_tls(mut self, require: bool) -> Self {
        self.config.connection.require_tls = require;
        self
    }

    /// Attempt STARTTLS even when not advertised.
    #[must_use]
    pub const fn opportunistic_tls(mut self, enabled: bool) -> Self {
        self.config.connection.opportunistic_tls = enabled;
        self
    }

    /// Sets the client host name sent with EHLO.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.connection.name = Some(name.into());
        self
    }

    /// Speak LMTP instead of SMTP.
    #[must_use]
    pub const fn lmtp(mut self, lmtp: bool) -> Self {
        self.config.connection.lmtp = lmtp;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn auth(mut self, credentials: Credentials) -> Self {
        self.config.connection.credentials = Some(credentials);
        self
    }

    /// Forces an authentication mechanism.
    #[must_use]
    pub fn auth_method(mut self, method: impl Into<String>) -> Self {
        self.config.connection.auth_method = Some(method.into());
        self
    }

    /// Registers a custom authentication mechanism.
    #[must_use]
    pub fn custom_auth(mut self, name: impl AsRef<str>, handler: Arc<dyn CustomAuth>) -> Self {
        self.config
            .connection
            .custom_auth
            .insert(name.as_ref().trim().to_uppercase(), handler);
        self
    }

    /// Enables or disables pooling.
    #[must_use]
    pub const fn pool(mut self, pool: bool) -> Self {
        self.config.pool = pool;
        self
    }

    /// Sets the live connection limit.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the per-connection message ceiling.
    #[must_use]
    pub const fn max_messages(mut self, max: usize) -> Self {
        self.config.max_messages = max;
        self
    }

    /// Limits dispatches to `limit` per rate window.
    #[must_use]
    pub const fn rate_limit(mut self, limit: usize) -> Self {
        self.config.rate_limit = Some(limit);
        self
    }

    /// Sets the rate window.
    #[must_use]
    pub const fn rate_delta(mut self, delta: Duration) -> Self {
        self.config.rate_delta = delta;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.connection_timeout = timeout;
        self
    }

    /// Sets the greeting timeout.
    #[must_use]
    pub const fn greeting_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.greeting_timeout = timeout;
        self
    }

    /// Sets the inactivity timeout; idle pooled connections are closed
    /// after it too.
    #[must_use]
    pub const fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.socket_timeout = timeout;
        self
    }

    /// Sets the TLS client configuration.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.connection.tls_config = Some(config);
        self
    }

    /// Overrides the certificate server name.
    #[must_use]
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection.tls_server_name = Some(name.into());
        self
    }

    /// Supplies transports instead of TCP connects.
    #[must_use]
    pub fn socket_provider(mut self, provider: Arc<dyn SocketProvider>) -> Self {
        self.config.connection.socket_provider = Some(provider);
        self
    }

    /// Resolves the endpoint and validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown service, a missing host or
    /// invalid pool settings.
    pub fn build(self) -> Result<TransportConfig> {
        let service: Option<&Service> = match &self.service {
            Some(name) => Some(
                services::lookup(name)
                    .ok_or_else(|| Error::Config(format!("unknown service {name}")))?,
            ),
            None => None,
        };

        let mut config = self.config;
        let secure = self
            .secure
            .or_else(|| service.map(|s| s.secure))
            .unwrap_or(false);
        let host = self
            .host
            .or_else(|| service.map(|s| s.host.to_string()))
            .ok_or_else(|| Error::Config("host or service is required".to_string()))?;
        let port = self.port.or_else(|| service.map(|s| s.port)).unwrap_or(if secure {
            sendpool_smtp::connection::options::DEFAULT_SECURE_PORT
        } else {
            sendpool_smtp::connection::options::DEFAULT_PORT
        });

        config.connection.host = host;
        config.connection.port = port;
        config.connection.secure = secure;
        config.validate()?;
        Ok(config)
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
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
    fn defaults() {
        let config = TransportConfig::builder()
            .host("smtp.example.com")
            .build()
            .unwrap();
        assert!(config.pool);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.max_messages, 100);
        assert_eq!(config.rate_limit, None);
        assert_eq!(config.rate_delta, Duration::from_secs(1));
        assert_eq!(config.connection.port, 587);
        assert!(!config.connection.secure);
    }

    #[test]
    fn secure_defaults_to_465() {
        let config = TransportConfig::builder()
            .host("smtp.example.com")
            .secure(true)
            .build()
            .unwrap();
        assert_eq!(config.connection_options().port, 465);
    }

    #[test]
    fn service_fills_endpoint() {
        let config = TransportConfig::builder()
            .service("gmail")
            .auth(Credentials::new("me@gmail.com", "app-password"))
            .build()
            .unwrap();
        assert_eq!(config.connection.host, "smtp.gmail.com");
        assert_eq!(config.connection.port, 465);
        assert!(config.connection.secure);
    }

    #[test]
    fn explicit_values_override_service() {
        let config = TransportConfig::builder()
            .service("Gmail")
            .host("relay.internal")
            .port(2525)
            .secure(false)
            .build()
            .unwrap();
        assert_eq!(config.connection.host, "relay.internal");
        assert_eq!(config.connection.port, 2525);
        assert!(!config.connection.secure);
    }

    #[test]
    fn invalid_settings() {
        assert!(matches!(
            TransportConfig::builder().build(),
            Err(Error::Config(_))
        ));
        assert!(TransportConfig::builder().service("nope").build().is_err());
        assert!(
            TransportConfig::builder()
                .host("mx")
                .max_connections(0)
                .build()
                .is_err()
        );
        assert!(
            TransportConfig::builder()
                .host("mx")
                .max_messages(0)
                .build()
                .is_err()
        );
        assert!(
            TransportConfig::builder()
                .host("mx")
                .rate_limit(0)
                .build()
                .is_err()
        );
        assert!(
            TransportConfig::builder()
                .host("mx")
                .rate_limit(10)
                .rate_delta(Duration::ZERO)
                .build()
                .is_err()
        );
    }
}
