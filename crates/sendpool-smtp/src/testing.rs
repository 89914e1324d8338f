//! Scripted in-memory SMTP server for tests.
//!
//! [`MockServer`] implements [`SocketProvider`]: every connect spawns a
//! session task on one end of a `tokio::io::duplex` pipe and hands the other
//! end to the client, so no network is involved. Sessions, commands and
//! deliveries are recorded for assertions.

#![allow(clippy::missing_panics_doc, missing_docs)]

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

use crate::connection::stream::BoxedStream;
use crate::connection::{ProvidedSocket, SocketProvider};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Behavior of a [`MockServer`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub hostname: String,
    /// Answer EHLO; when false EHLO gets `502` and only HELO works.
    pub ehlo: bool,
    /// Extension lines advertised after the EHLO greeting line.
    pub extensions: Vec<String>,
    /// Recipient domains answered with `550`.
    pub reject_domains: Vec<String>,
    /// Sender domains answered with `550`.
    pub reject_sender_domains: Vec<String>,
    /// Accepted username/password pairs.
    pub users: Vec<(String, String)>,
    /// Accepted XOAUTH2 token.
    pub xoauth2_token: Option<String>,
    /// Custom mechanism name and the single payload it accepts.
    pub custom_mechanism: Option<(String, String)>,
    /// Refuse MAIL FROM before a successful AUTH.
    pub require_auth: bool,
    /// Speak LMTP: accept LHLO, reply once per recipient after DATA.
    pub lmtp: bool,
    /// LMTP recipients whose per-recipient status is `550`.
    pub lmtp_fail: Vec<String>,
    /// Drop the connection after the first body line.
    pub close_during_data: bool,
    /// Final reply after DATA instead of `250`.
    pub final_reply: Option<String>,
    /// Delay before the greeting.
    pub greeting_delay: Option<Duration>,
    /// Never send a greeting.
    pub silent: bool,
    /// Send `421` and close after this long without a command.
    pub idle_close_after: Option<Duration>,
    /// Delay before every reply to DATA's final status.
    pub delivery_delay: Option<Duration>,
    /// Advertise STARTTLS and accept the handshake with this config.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Extensions advertised once TLS is up; `None` reuses `extensions`.
    pub tls_extensions: Option<Vec<String>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            hostname: "mock.example.net".to_string(),
            ehlo: true,
            extensions: vec![
                "PIPELINING".to_string(),
                "SIZE 10485760".to_string(),
                "8BITMIME".to_string(),
                "SMTPUTF8".to_string(),
                "ENHANCEDSTATUSCODES".to_string(),
                "AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2".to_string(),
            ],
            reject_domains: vec!["invalid.recipient".to_string()],
            reject_sender_domains: Vec::new(),
            users: vec![("user".to_string(), "pass".to_string())],
            xoauth2_token: None,
            custom_mechanism: None,
            require_auth: false,
            lmtp: false,
            lmtp_fail: Vec::new(),
            close_during_data: false,
            final_reply: None,
            greeting_delay: None,
            silent: false,
            idle_close_after: None,
            delivery_delay: None,
            tls: None,
            tls_extensions: None,
        }
    }
}

/// One command line as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub line: String,
    /// More client bytes were already buffered behind this line.
    pub batched: bool,
}

/// Log of one client session.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    pub id: usize,
    pub commands: Vec<Received>,
    pub authenticated_as: Option<String>,
    /// STARTTLS completed.
    pub secured: bool,
}

impl SessionLog {
    /// Command lines only.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.line.clone()).collect()
    }
}

/// A message accepted after DATA.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub session: usize,
    pub from: String,
    pub to: Vec<String>,
    /// Body with dot-stuffing removed, CRLF line endings.
    pub body: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct State {
    connections: usize,
    live: usize,
    peak_live: usize,
    sessions: Vec<SessionLog>,
    deliveries: Vec<Delivery>,
}

/// In-memory SMTP server.
#[derive(Debug)]
pub struct MockServer {
    config: MockConfig,
    state: Mutex<State>,
}

impl MockServer {
    /// Creates a server.
    #[must_use]
    pub fn new(config: MockConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
        })
    }

    /// Wraps the server as a connection socket provider.
    #[must_use]
    pub fn provider(self: &Arc<Self>) -> Arc<dyn SocketProvider> {
        Arc::new(Arc::clone(self))
    }

    /// Creates a server with [`MockConfig::default`].
    #[must_use]
    pub fn standard() -> Arc<Self> {
        Self::new(MockConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total sessions opened.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Sessions currently open.
    #[must_use]
    pub fn live(&self) -> usize {
        self.lock().live
    }

    /// Highest number of simultaneously open sessions.
    #[must_use]
    pub fn peak_live(&self) -> usize {
        self.lock().peak_live
    }

    /// Snapshot of every session log.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionLog> {
        self.lock().sessions.clone()
    }

    /// Snapshot of every delivery, in arrival order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    fn open_session(&self) -> usize {
        let mut state = self.lock();
        state.connections += 1;
        state.live += 1;
        state.peak_live = state.peak_live.max(state.live);
        let id = state.sessions.len();
        state.sessions.push(SessionLog {
            id,
            ..SessionLog::default()
        });
        id
    }

    fn end_session(&self, open: &mut bool) {
        if *open {
            *open = false;
            let mut state = self.lock();
            state.live = state.live.saturating_sub(1);
        }
    }

    fn record(&self, session: usize, line: &str, batched: bool) {
        if let Some(log) = self.lock().sessions.get_mut(session) {
            log.commands.push(Received {
                line: line.to_string(),
                batched,
            });
        }
    }

    fn check_password(&self, user: &str, pass: &str) -> bool {
        self.config
            .users
            .iter()
            .any(|(u, p)| u == user && p == pass)
    }

    fn cram_md5_ok(&self, challenge: &str, answer: &str) -> Option<String> {
        let (user, digest) = answer.split_once(' ')?;
        let (_, pass) = self.config.users.iter().find(|(u, _)| u == user)?;
        let mut mac = Hmac::<Md5>::new_from_slice(pass.as_bytes()).ok()?;
        mac.update(challenge.as_bytes());
        let expected: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        (expected == digest).then(|| user.to_string())
    }
}

#[async_trait]
impl SocketProvider for Arc<MockServer> {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<ProvidedSocket> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let id = self.open_session();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut session = Session {
                server: &this,
                id,
                io: BufReader::new(Box::new(server) as BoxedStream),
                open: true,
                secure: false,
                from: None,
                to: Vec::new(),
                authenticated: false,
            };
            let _ = session.run().await;
            this.end_session(&mut session.open);
        });
        Ok(ProvidedSocket::plain(client))
    }
}

struct Session<'a> {
    server: &'a MockServer,
    id: usize,
    io: BufReader<BoxedStream>,
    open: bool,
    secure: bool,
    from: Option<String>,
    to: Vec<String>,
    authenticated: bool,
}

enum Flow {
    Continue,
    Quit,
}

impl Session<'_> {
    async fn run(&mut self) -> io::Result<()> {
        let server = self.server;
        let config = &server.config;
        if let Some(delay) = config.greeting_delay {
            tokio::time::sleep(delay).await;
        }
        if config.silent {
            while self.read_raw().await?.is_some() {}
            return Ok(());
        }
        self.reply(&format!("220 {} ESMTP mock", config.hostname))
            .await?;

        loop {
            let line = match config.idle_close_after {
                Some(after) => {
                    if let Ok(line) = tokio::time::timeout(after, self.read_command()).await {
                        line?
                    } else {
                        self.reply("421 4.4.2 Idle timeout, closing connection")
                            .await?;
                        return Ok(());
                    }
                }
                None => self.read_command().await?,
            };
            let Some(line) = line else {
                return Ok(());
            };
            if let Flow::Quit = self.dispatch(&line).await? {
                return Ok(());
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(&mut self, line: &str) -> io::Result<Flow> {
        let server = self.server;
        let config = &server.config;
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let verb = verb.to_uppercase();

        match verb.as_str() {
            "EHLO" | "LHLO" => {
                let allowed = if config.lmtp {
                    verb == "LHLO"
                } else {
                    verb == "EHLO" && config.ehlo
                };
                if !allowed {
                    self.reply("502 5.5.2 Error: command not recognized")
                        .await?;
                    return Ok(Flow::Continue);
                }
                let mut lines = vec![config.hostname.clone()];
                if self.secure {
                    lines.extend(
                        config
                            .tls_extensions
                            .as_ref()
                            .unwrap_or(&config.extensions)
                            .iter()
                            .cloned(),
                    );
                } else {
                    lines.extend(config.extensions.iter().cloned());
                    if config.tls.is_some() {
                        lines.push("STARTTLS".to_string());
                    }
                }
                self.multi_reply(250, &lines).await?;
            }
            "HELO" if !config.lmtp => {
                self.reply(&format!("250 {}", config.hostname)).await?;
            }
            "STARTTLS" => match config.tls.as_ref().filter(|_| !self.secure) {
                Some(tls) => self.starttls(Arc::clone(tls)).await?,
                None => self.reply("454 4.7.0 TLS not available").await?,
            },
            "AUTH" => self.auth(rest).await?,
            "MAIL" => {
                let addr = path(rest);
                if config.require_auth && !self.authenticated {
                    self.reply("530 5.7.0 Authentication required").await?;
                } else if domain_in(&addr, &config.reject_sender_domains) {
                    self.reply(&format!("550 5.7.1 <{addr}>: Sender address rejected"))
                        .await?;
                } else {
                    self.from = Some(addr);
                    self.to.clear();
                    self.reply("250 2.1.0 Ok").await?;
                }
            }
            "RCPT" => {
                let addr = path(rest);
                if self.from.is_none() {
                    self.reply("503 5.5.1 Error: need MAIL command").await?;
                } else if domain_in(&addr, &config.reject_domains) {
                    self.reply(&format!(
                        "550 5.1.1 <{addr}>: Recipient address rejected: User unknown"
                    ))
                    .await?;
                } else {
                    self.to.push(addr);
                    self.reply("250 2.1.5 Ok").await?;
                }
            }
            "DATA" => {
                if self.to.is_empty() {
                    self.reply("554 5.5.1 Error: no valid recipients").await?;
                    return Ok(Flow::Continue);
                }
                self.reply("354 End data with <CR><LF>.<CR><LF>").await?;
                if config.close_during_data {
                    let _ = self.read_raw().await?;
                    return Ok(Flow::Quit);
                }
                let Some(body) = self.read_body().await? else {
                    return Ok(Flow::Quit);
                };
                if let Some(delay) = config.delivery_delay {
                    tokio::time::sleep(delay).await;
                }
                self.deliver(body).await?;
            }
            "RSET" => {
                self.from = None;
                self.to.clear();
                self.reply("250 2.0.0 Ok").await?;
            }
            "NOOP" => self.reply("250 2.0.0 Ok").await?,
            "QUIT" => {
                server.end_session(&mut self.open);
                self.reply("221 2.0.0 Bye").await?;
                return Ok(Flow::Quit);
            }
            _ => {
                self.reply("502 5.5.2 Error: command not recognized")
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn starttls(&mut self, config: Arc<rustls::ServerConfig>) -> io::Result<()> {
        self.reply("220 2.0.0 Ready to start TLS").await?;
        let (placeholder, _) = tokio::io::duplex(1);
        let plain = std::mem::replace(
            &mut self.io,
            BufReader::new(Box::new(placeholder) as BoxedStream),
        );
        let stream = TlsAcceptor::from(config).accept(plain.into_inner()).await?;
        self.io = BufReader::new(Box::new(stream) as BoxedStream);
        self.secure = true;
        self.authenticated = false;
        self.from = None;
        self.to.clear();
        if let Some(log) = self.server.lock().sessions.get_mut(self.id) {
            log.secured = true;
        }
        Ok(())
    }

    async fn deliver(&mut self, body: Vec<u8>) -> io::Result<()> {
        let server = self.server;
        let config = &server.config;
        let from = self.from.take().unwrap_or_default();
        let to = std::mem::take(&mut self.to);

        let delivered: Vec<String> = if config.lmtp {
            to.iter()
                .filter(|rcpt| !config.lmtp_fail.contains(rcpt))
                .cloned()
                .collect()
        } else if config.final_reply.is_some() {
            Vec::new()
        } else {
            to.clone()
        };

        let queued = {
            let mut state = server.lock();
            if !delivered.is_empty() {
                state.deliveries.push(Delivery {
                    session: self.id,
                    from,
                    to: delivered,
                    body,
                    at: Instant::now(),
                });
            }
            state.deliveries.len()
        };

        if config.lmtp {
            for rcpt in &to {
                if config.lmtp_fail.contains(rcpt) {
                    self.reply(&format!("550 5.1.1 <{rcpt}>: mailbox unavailable"))
                        .await?;
                } else {
                    self.reply(&format!("250 2.1.5 <{rcpt}> delivered")).await?;
                }
            }
        } else if let Some(reply) = &config.final_reply {
            self.reply(reply).await?;
        } else {
            self.reply(&format!("250 2.0.0 Ok: queued as MOCK{queued}"))
                .await?;
        }
        Ok(())
    }

    async fn auth(&mut self, rest: &str) -> io::Result<()> {
        let server = self.server;
        let config = &server.config;
        let mut parts = rest.split_whitespace();
        let mechanism = parts.next().unwrap_or_default().to_uppercase();
        let initial = parts.next().map(ToString::to_string);

        let user = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => {
                        self.reply("334 ").await?;
                        self.read_line_text().await?
                    }
                };
                decode(&payload).and_then(|text| {
                    let mut fields = text.split('\0');
                    let _authz = fields.next()?;
                    let user = fields.next()?;
                    let pass = fields.next()?;
                    server
                        .check_password(user, pass)
                        .then(|| user.to_string())
                })
            }
            "LOGIN" => {
                self.reply("334 VXNlcm5hbWU6").await?;
                let user = decode(&self.read_line_text().await?).unwrap_or_default();
                self.reply("334 UGFzc3dvcmQ6").await?;
                let pass = decode(&self.read_line_text().await?).unwrap_or_default();
                server.check_password(&user, &pass).then_some(user)
            }
            "CRAM-MD5" => {
                let challenge = format!("<{}.{}@{}>", 4242 + self.id, self.id, config.hostname);
                self.reply(&format!("334 {}", STANDARD.encode(&challenge)))
                    .await?;
                let answer = self.read_line_text().await?;
                if answer == "*" {
                    self.reply("501 5.7.0 Authentication cancelled").await?;
                    return Ok(());
                }
                decode(&answer).and_then(|text| server.cram_md5_ok(&challenge, &text))
            }
            "XOAUTH2" => {
                let text = initial.as_deref().and_then(decode).unwrap_or_default();
                let user = text
                    .split('\x01')
                    .find_map(|f| f.strip_prefix("user="))
                    .unwrap_or_default()
                    .to_string();
                let token = text
                    .split('\x01')
                    .find_map(|f| f.strip_prefix("auth=Bearer "))
                    .unwrap_or_default();
                if config.xoauth2_token.as_deref() == Some(token) {
                    Some(user)
                } else {
                    let detail = r#"{"status":"401","schemes":"bearer","scope":"https://mail.google.com/"}"#;
                    self.reply(&format!("334 {}", STANDARD.encode(detail)))
                        .await?;
                    let _ = self.read_line_text().await?;
                    None
                }
            }
            name => match &config.custom_mechanism {
                Some((custom, expected)) if custom.eq_ignore_ascii_case(name) => {
                    (initial.as_deref() == Some(expected.as_str())).then(|| custom.clone())
                }
                _ => {
                    self.reply("504 5.5.4 Unrecognized authentication type")
                        .await?;
                    return Ok(());
                }
            },
        };

        match user {
            Some(user) => {
                self.authenticated = true;
                if let Some(log) = server.lock().sessions.get_mut(self.id) {
                    log.authenticated_as = Some(user);
                }
                self.reply("235 2.7.0 Authentication successful").await
            }
            None => {
                self.reply("535 5.7.8 Authentication credentials invalid")
                    .await
            }
        }
    }

    async fn read_raw(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = self.io.read_until(b'\n', &mut line).await?;
        Ok((n > 0).then_some(line))
    }

    async fn read_command(&mut self) -> io::Result<Option<String>> {
        let Some(raw) = self.read_raw().await? else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        let batched = !self.io.buffer().is_empty();
        self.server.record(self.id, &line, batched);
        Ok(Some(line))
    }

    async fn read_line_text(&mut self) -> io::Result<String> {
        self.read_command()
            .await?
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }

    async fn read_body(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut body = Vec::new();
        loop {
            let Some(line) = self.read_raw().await? else {
                return Ok(None);
            };
            if line == b".\r\n" {
                return Ok(Some(body));
            }
            match line.strip_prefix(b".") {
                Some(rest) => body.extend_from_slice(rest),
                None => body.extend_from_slice(&line),
            }
        }
    }

    async fn reply(&mut self, line: &str) -> io::Result<()> {
        let stream = self.io.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await
    }

    async fn multi_reply(&mut self, code: u16, lines: &[String]) -> io::Result<()> {
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{code}{sep}{line}\r\n"));
        }
        let stream = self.io.get_mut();
        stream.write_all(out.as_bytes()).await?;
        stream.flush().await
    }
}

fn path(arg: &str) -> String {
    let start = arg.find('<').map_or(0, |i| i + 1);
    let end = arg[start..].find('>').map_or(arg.len(), |i| start + i);
    arg[start..end].to_string()
}

fn domain_in(addr: &str, domains: &[String]) -> bool {
    addr.rsplit_once('@')
        .is_some_and(|(_, domain)| domains.iter().any(|d| d.eq_ignore_ascii_case(domain)))
}

fn decode(payload: &str) -> Option<String> {
    STANDARD
        .decode(payload.trim())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
