//! Connection configuration types.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::SocketProvider;
use crate::auth::{Credentials, CustomAuth, CustomAuthMap};

/// Default submission port.
pub const DEFAULT_PORT: u16 = 587;

/// Default implicit-TLS port.
pub const DEFAULT_SECURE_PORT: u16 = 465;

/// Default budget for opening the socket.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Default budget for the `220` greeting.
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default inactivity budget.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Settings for one SMTP/LMTP connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Implicit TLS from the first byte.
    pub secure: bool,
    /// Never issue STARTTLS.
    pub ignore_tls: bool,
    /// Fail unless the session ends up encrypted.
    pub require_tls: bool,
    /// Try STARTTLS even if not advertised; continue in plaintext if refused.
    pub opportunistic_tls: bool,
    /// Client host name for EHLO; `None` picks [`default_client_name`].
    pub name: Option<String>,
    /// Speak LMTP (LHLO, per-recipient DATA replies).
    pub lmtp: bool,
    /// Credentials; `None` skips authentication.
    pub credentials: Option<Credentials>,
    /// Mechanism override (built-in name or a key of `custom_auth`).
    pub auth_method: Option<String>,
    /// Custom mechanisms keyed by uppercase name.
    pub custom_auth: CustomAuthMap,
    /// Budget for opening the socket, including implicit TLS.
    pub connection_timeout: Duration,
    /// Budget for the `220` greeting.
    pub greeting_timeout: Duration,
    /// Inactivity budget for every later read and write.
    pub socket_timeout: Duration,
    /// TLS client configuration; defaults to the `webpki-roots` store.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Server name for certificate checks; defaults to `host`.
    pub tls_server_name: Option<String>,
    /// Supplies the transport instead of a TCP connect.
    pub socket_provider: Option<Arc<dyn SocketProvider>>,
}

impl ConnectionOptions {
    /// Creates options for `host` with STARTTLS on port 587.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self::builder(host).build()
    }

    /// Creates an options builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::new(host)
    }

    /// Returns the client name sent with EHLO/HELO/LHLO.
    #[must_use]
    pub fn client_name(&self) -> String {
        self.name
            .as_deref()
            .map_or_else(default_client_name, format_client_name)
    }

    /// Returns the name used for certificate verification.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut custom: Vec<&String> = self.custom_auth.keys().collect();
        custom.sort();
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("ignore_tls", &self.ignore_tls)
            .field("require_tls", &self.require_tls)
            .field("opportunistic_tls", &self.opportunistic_tls)
            .field("name", &self.name)
            .field("lmtp", &self.lmtp)
            .field("credentials", &self.credentials)
            .field("auth_method", &self.auth_method)
            .field("custom_auth", &custom)
            .field("connection_timeout", &self.connection_timeout)
            .field("greeting_timeout", &self.greeting_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("tls_config", &self.tls_config.is_some())
            .field("tls_server_name", &self.tls_server_name)
            .field("socket_provider", &self.socket_provider.is_some())
            .finish()
    }
}

/// Builder for connection options.
#[derive(Clone)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions,
    port: Option<u16>,
}

impl ConnectionOptionsBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            options: ConnectionOptions {
                host: host.into(),
                port: DEFAULT_PORT,
                secure: false,
                ignore_tls: false,
                require_tls: false,
                opportunistic_tls: false,
                name: None,
                lmtp: false,
                credentials: None,
                auth_method: None,
                custom_auth: HashMap::new(),
                connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
                greeting_timeout: DEFAULT_GREETING_TIMEOUT,
                socket_timeout: DEFAULT_SOCKET_TIMEOUT,
                tls_config: None,
                tls_server_name: None,
                socket_provider: None,
            },
            port: None,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables implicit TLS.
    #[must_use]
    pub const fn secure(mut self, secure: bool) -> Self {
        self.options.secure = secure;
        self
    }

    /// Never issue STARTTLS.
    #[must_use]
    pub const fn ignore_tls(mut self, ignore: bool) -> Self {
        self.options.ignore_tls = ignore;
        self
    }

    /// Require an encrypted session.
    #[must_use]
    pub const fn require_tls(mut self, require: bool) -> Self {
        self.options.require_tls = require;
        self
    }

    /// Attempt STARTTLS even when not advertised.
    #[must_use]
    pub const fn opportunistic_tls(mut self, enabled: bool) -> Self {
        self.options.opportunistic_tls = enabled;
        self
    }

    /// Sets the client host name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Speak LMTP instead of SMTP.
    #[must_use]
    pub const fn lmtp(mut self, lmtp: bool) -> Self {
        self.options.lmtp = lmtp;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.options.credentials = Some(credentials);
        self
    }

    /// Forces an authentication mechanism.
    #[must_use]
    pub fn auth_method(mut self, method: impl Into<String>) -> Self {
        self.options.auth_method = Some(method.into());
        self
    }

    /// Registers a custom mechanism.
    #[must_use]
    pub fn custom_auth(mut self, name: impl AsRef<str>, handler: Arc<dyn CustomAuth>) -> Self {
        self.options
            .custom_auth
            .insert(name.as_ref().trim().to_uppercase(), handler);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.options.connection_timeout = timeout;
        self
    }

    /// Sets the greeting timeout.
    #[must_use]
    pub const fn greeting_timeout(mut self, timeout: Duration) -> Self {
        self.options.greeting_timeout = timeout;
        self
    }

    /// Sets the inactivity timeout.
    #[must_use]
    pub const fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.options.socket_timeout = timeout;
        self
    }

    /// Sets the TLS client configuration.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.options.tls_config = Some(config);
        self
    }

    /// Overrides the certificate server name.
    #[must_use]
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.options.tls_server_name = Some(name.into());
        self
    }

    /// Sets the socket provider.
    #[must_use]
    pub fn socket_provider(mut self, provider: Arc<dyn SocketProvider>) -> Self {
        self.options.socket_provider = Some(provider);
        self
    }

    /// Builds the options.
    #[must_use]
    pub fn build(mut self) -> ConnectionOptions {
        self.options.port = self.port.unwrap_or(if self.options.secure {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        });
        self.options
    }
}

impl fmt::Debug for ConnectionOptionsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptionsBuilder")
            .field("options", &self.options)
            .field("port", &self.port)
            .finish()
    }
}

/// The system host name, or `localhost` when it is empty or not ASCII.
#[must_use]
pub fn default_client_name() -> String {
    let name = gethostname::gethostname();
    name.to_str()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.is_ascii())
        .map_or_else(|| "localhost".to_string(), format_client_name)
}

/// Brackets IP literals (`[192.0.2.1]`, `[IPv6:2001:db8::1]`).
#[must_use]
pub fn format_client_name(name: &str) -> String {
    match name.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("[{ip}]"),
        Ok(IpAddr::V6(ip)) => format!("[IPv6:{ip}]"),
        Err(_) => name.to_string(),
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
    fn test_defaults() {
        let options = ConnectionOptions::new("smtp.example.com");
        assert_eq!(options.port, 587);
        assert!(!options.secure);
        assert_eq!(options.connection_timeout, Duration::from_secs(120));
        assert_eq!(options.greeting_timeout, Duration::from_secs(30));
        assert_eq!(options.socket_timeout, Duration::from_secs(600));
        assert_eq!(options.server_name(), "smtp.example.com");
    }

    #[test]
    fn test_secure_default_port() {
        let options = ConnectionOptions::builder("smtp.example.com")
            .secure(true)
            .build();
        assert_eq!(options.port, 465);

        let explicit = ConnectionOptions::builder("smtp.example.com")
            .secure(true)
            .port(2465)
            .build();
        assert_eq!(explicit.port, 2465);
    }

    #[test]
    fn test_client_name_formatting() {
        assert_eq!(format_client_name("client.example.com"), "client.example.com");
        assert_eq!(format_client_name("192.0.2.1"), "[192.0.2.1]");
        assert_eq!(format_client_name("2001:db8::1"), "[IPv6:2001:db8::1]");

        let options = ConnectionOptions::builder("mx").name("10.0.0.1").build();
        assert_eq!(options.client_name(), "[10.0.0.1]");
    }

    #[test]
    fn test_default_client_name_is_system_host_name() {
        let system = gethostname::gethostname();
        let expected = system
            .to_str()
            .map(str::trim)
            .filter(|name| !name.is_empty() && name.is_ascii())
            .map_or_else(|| "localhost".to_string(), format_client_name);
        assert_eq!(default_client_name(), expected);
        assert_eq!(ConnectionOptions::new("mx").client_name(), expected);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let options = ConnectionOptions::builder("mx")
            .credentials(Credentials::new("user", "hunter2"))
            .tls_server_name("mail.example.com")
            .build();
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(options.server_name(), "mail.example.com");
    }
}
