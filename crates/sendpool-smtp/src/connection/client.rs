//! SMTP connection state machine.
//!
//! One [`Connection`] owns one transport and walks it through
//! `Idle -> Connecting -> Greeted -> [Upgrading -> Greeted] ->
//! [Authenticating] -> Ready <-> Sending -> Closing -> Closed`. Any fatal
//! error moves it to `Errored`, which is terminal.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{ConnectionOptions, FramedStream, SmtpStream, connect_tcp, tls_connector};
use crate::auth::{self, AuthStrategy};
use crate::codec::{DotStuffer, contains_8bit};
use crate::command::{Command, MailParams};
use crate::error::{Error, Result, TimeoutPhase};
use crate::types::{Address, Capabilities, Dsn, Envelope, RecipientError, Reply, ReplyCode, SendInfo};

/// Body bytes read from the message source per write.
const CHUNK_SIZE: usize = 8 * 1024;

/// Budget for the best-effort QUIT on close.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Idle,
    /// Opening the socket and waiting for the greeting.
    Connecting,
    /// Greeting (and EHLO) done.
    Greeted,
    /// STARTTLS in progress.
    Upgrading,
    /// SASL exchange in progress.
    Authenticating,
    /// Ready for a mail transaction.
    Ready,
    /// A mail transaction is running.
    Sending,
    /// QUIT in progress.
    Closing,
    /// Closed cleanly.
    Closed,
    /// Failed; no further commands are accepted.
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One SMTP or LMTP client connection.
pub struct Connection {
    id: u64,
    options: Arc<ConnectionOptions>,
    state: ConnectionState,
    framed: Option<FramedStream>,
    capabilities: Capabilities,
    secure: bool,
    authenticated: bool,
    in_transaction: bool,
}

impl Connection {
    /// Creates an unconnected connection.
    #[must_use]
    pub fn new(options: Arc<ConnectionOptions>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            state: ConnectionState::Idle,
            framed: None,
            capabilities: Capabilities::default(),
            secure: false,
            authenticated: false,
            in_transaction: false,
        }
    }

    /// Process-unique connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Capabilities from the last EHLO/HELO/LHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Options this connection was created with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// True once the session runs over TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// True after a successful AUTH exchange.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True in `Ready`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Runs connect, handshake, upgrade and authenticate.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn establish(&mut self) -> Result<()> {
        self.connect().await?;
        self.handshake().await?;
        self.upgrade().await?;
        self.authenticate().await
    }

    /// Opens the transport and waits for the `220` greeting.
    ///
    /// # Errors
    ///
    /// Returns a connection, TLS or timeout error.
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Idle, "connect")?;
        self.state = ConnectionState::Connecting;
        let result = self.open().await;
        self.record(result)?;
        self.state = ConnectionState::Greeted;
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        let options = Arc::clone(&self.options);
        debug!(cid = self.id, host = %options.host, port = options.port, "connecting");

        let opening = async {
            let socket = match &options.socket_provider {
                Some(provider) => provider.connect(&options.host, options.port).await?,
                None => connect_tcp(&options.host, options.port).await?,
            };
            let mut stream = SmtpStream::Plain(socket.stream);
            let mut secure = socket.secured;
            if options.secure && !secure {
                let connector = tls_connector(options.tls_config.clone());
                stream = stream
                    .upgrade_to_tls(&connector, options.server_name())
                    .await?;
                secure = true;
            }
            Ok::<_, Error>((stream, secure))
        };

        let (stream, secure) = tokio::time::timeout(options.connection_timeout, opening)
            .await
            .map_err(|_| Error::Timeout {
                phase: TimeoutPhase::Connect,
                after: options.connection_timeout,
            })??;

        self.secure = secure;
        let framed = self
            .framed
            .insert(FramedStream::new(stream, options.socket_timeout, self.id));

        let greeting = tokio::time::timeout(options.greeting_timeout, framed.read_reply())
            .await
            .map_err(|_| Error::Timeout {
                phase: TimeoutPhase::Greeting,
                after: options.greeting_timeout,
            })??;

        if greeting.code != ReplyCode::SERVICE_READY {
            return Err(Error::smtp_error(
                greeting.code.as_u16(),
                greeting.message_text(),
            ));
        }

        debug!(cid = self.id, secure, greeting = %greeting, "connected");
        Ok(())
    }

    /// Sends EHLO (LHLO in LMTP mode) and records the capabilities.
    ///
    /// A rejected EHLO falls back to HELO with empty capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if both greetings are rejected.
    pub async fn handshake(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Greeted, "handshake")?;
        let result = self.greet().await;
        self.record(result)
    }

    async fn greet(&mut self) -> Result<()> {
        let cid = self.id;
        let hostname = self.options.client_name();
        let lmtp = self.options.lmtp;
        let framed = self.framed.as_mut().ok_or_else(no_transport)?;

        let reply = if lmtp {
            command(
                framed,
                &Command::Lhlo {
                    hostname: hostname.clone(),
                },
            )
            .await?
        } else {
            command(
                framed,
                &Command::Ehlo {
                    hostname: hostname.clone(),
                },
            )
            .await?
        };

        let capabilities = if reply.is_success() {
            Capabilities::from_ehlo(&reply)
        } else if lmtp || reply.code == ReplyCode::SERVICE_UNAVAILABLE {
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        } else {
            debug!(cid, reply = %reply, "EHLO rejected, falling back to HELO");
            let reply = command(framed, &Command::Helo { hostname }).await?;
            if !reply.is_success() {
                return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
            }
            Capabilities::from_helo(&reply)
        };

        debug!(
            cid,
            extensions = ?capabilities.keywords(),
            helo = capabilities.is_helo_fallback(),
            "capabilities"
        );
        self.capabilities = capabilities;
        Ok(())
    }

    /// Negotiates STARTTLS according to the TLS options.
    ///
    /// # Errors
    ///
    /// Returns a TLS error if encryption is required but unavailable, or if
    /// the handshake fails.
    pub async fn upgrade(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Greeted, "upgrade")?;
        let result = self.starttls().await;
        self.record(result)
    }

    async fn starttls(&mut self) -> Result<()> {
        let options = Arc::clone(&self.options);
        if self.secure {
            return Ok(());
        }
        if options.ignore_tls {
            if options.require_tls {
                return Err(Error::TlsRequired("STARTTLS is disabled".to_string()));
            }
            return Ok(());
        }

        let advertised = self.capabilities.supports_starttls();
        if !advertised && !options.require_tls && !options.opportunistic_tls {
            return Ok(());
        }

        self.state = ConnectionState::Upgrading;
        let framed = self.framed_mut()?;
        let reply = command(framed, &Command::StartTls).await?;

        if reply.code != ReplyCode::SERVICE_READY {
            self.state = ConnectionState::Greeted;
            if options.require_tls {
                return Err(Error::TlsRequired(format!("server refused STARTTLS: {reply}")));
            }
            if options.opportunistic_tls {
                debug!(cid = self.id, reply = %reply, "STARTTLS refused, staying in plaintext");
                return Ok(());
            }
            return Err(Error::StartTlsRefused {
                code: reply.code.as_u16(),
                message: reply.message_text(),
            });
        }

        let framed = self.framed.take().ok_or_else(no_transport)?;
        let connector = tls_connector(options.tls_config.clone());
        let stream = framed
            .into_inner()?
            .upgrade_to_tls(&connector, options.server_name())
            .await?;
        self.framed = Some(FramedStream::new(stream, options.socket_timeout, self.id));
        self.secure = true;
        self.state = ConnectionState::Greeted;
        debug!(cid = self.id, "TLS established");

        self.greet().await
    }

    /// Authenticates if credentials or a mechanism are configured, then
    /// moves to `Ready`. Without an explicit mechanism, a server that
    /// advertises no AUTH is used unauthenticated.
    ///
    /// A rejected exchange leaves the connection in `Greeted`.
    ///
    /// # Errors
    ///
    /// Returns an authentication error, or a fatal transport error.
    pub async fn authenticate(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Greeted, "authenticate")?;
        let options = Arc::clone(&self.options);

        if options.credentials.is_none() && options.auth_method.is_none() {
            self.state = ConnectionState::Ready;
            return Ok(());
        }
        if options.auth_method.is_none() && self.capabilities.auth_methods().is_empty() {
            debug!(cid = self.id, "server does not advertise AUTH, continuing unauthenticated");
            self.state = ConnectionState::Ready;
            return Ok(());
        }

        let strategy = AuthStrategy::select(
            &self.capabilities,
            options.credentials.as_ref(),
            options.auth_method.as_deref(),
            &options.custom_auth,
        )?;

        self.state = ConnectionState::Authenticating;
        let framed = self.framed.as_mut().ok_or_else(no_transport)?;
        let result = auth::authenticate(
            framed,
            &strategy,
            &self.capabilities,
            options.credentials.as_ref(),
            &options.custom_auth,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(cid = self.id, mechanism = strategy.name(), "authenticated");
                self.authenticated = true;
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(self.fail(err)),
            Err(err) => {
                self.state = ConnectionState::Greeted;
                Err(err)
            }
        }
    }

    /// Runs one mail transaction.
    ///
    /// Individual recipient rejections are reported in [`SendInfo`]; the send
    /// fails only when the sender or every recipient is rejected, or the
    /// message itself is refused. After a non-fatal failure the transaction
    /// is reset so the connection stays usable.
    ///
    /// # Errors
    ///
    /// Returns envelope, message, protocol, stream, timeout or connection
    /// errors. Fatal ones leave the connection `Errored`.
    pub async fn send<R>(&mut self, envelope: &Envelope, message: R) -> Result<SendInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.expect_state(ConnectionState::Ready, "send")?;
        self.state = ConnectionState::Sending;

        let result = self.transaction(envelope, message).await;
        match result {
            Ok(info) => {
                self.state = ConnectionState::Ready;
                Ok(info)
            }
            Err(err) if err.is_fatal() => Err(self.fail(err)),
            Err(err) => {
                if self.in_transaction {
                    if let Err(reset) = self.rset().await {
                        warn!(cid = self.id, error = %reset, "RSET failed");
                        self.fail(reset);
                        return Err(err);
                    }
                }
                self.state = ConnectionState::Ready;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn transaction<R>(&mut self, envelope: &Envelope, mut message: R) -> Result<SendInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let caps = &self.capabilities;
        let started = Instant::now();

        let wants_utf8 = envelope.smtp_utf8 || envelope.has_non_ascii_address();
        let use_utf8 = wants_utf8 && caps.supports_smtputf8();

        if !envelope.from.is_empty() {
            let sender = Address::new(envelope.from.as_str()).map_err(|err| Error::Envelope {
                code: None,
                message: format!("Invalid sender {}: {err}", envelope.from),
                rejected: Vec::new(),
            })?;
            if !sender.is_ascii() && !use_utf8 {
                return Err(Error::Envelope {
                    code: None,
                    message: format!("Sender {sender} requires SMTPUTF8"),
                    rejected: Vec::new(),
                });
            }
        }

        let mut rejected_errors = Vec::new();
        let mut valid = Vec::new();
        for rcpt in envelope.unique_recipients() {
            match Address::new(rcpt) {
                Err(err) => rejected_errors.push(RecipientError::local(rcpt, err.to_string())),
                Ok(addr) if !addr.is_ascii() && !use_utf8 => rejected_errors.push(
                    RecipientError::local(rcpt, "Recipient requires SMTPUTF8"),
                ),
                Ok(_) => valid.push(rcpt.to_string()),
            }
        }

        if valid.is_empty() {
            return Err(Error::Envelope {
                code: None,
                message: "No valid recipients".to_string(),
                rejected: rejected_errors,
            });
        }

        if let (Some(size), Some(max)) = (envelope.size, caps.max_message_size()) {
            if size > max {
                return Err(Error::message(
                    None,
                    format!("Message size {size} exceeds server limit {max}"),
                ));
            }
        }

        let dsn = envelope.dsn.as_ref().filter(|_| caps.supports_dsn());
        let params = MailParams {
            size: envelope.size.filter(|_| caps.supports_size()),
            body: (envelope.use_8bit && caps.supports_8bitmime()).then_some("8BITMIME"),
            smtp_utf8: use_utf8,
            ret: dsn.and_then(|d| d.ret),
            envid: dsn.and_then(|d| d.envid.clone()),
        };
        let allow_8bit = params.body.is_some() || params.smtp_utf8;
        let notify = dsn.and_then(Dsn::notify_param);
        let orcpt = dsn.and_then(|d| d.orcpt.clone());
        let pipelining = caps.supports_pipelining();

        let mail = Command::MailFrom {
            from: envelope.from.clone(),
            params,
        };
        let rcpts: Vec<Command> = valid
            .iter()
            .map(|to| Command::RcptTo {
                to: to.clone(),
                notify: notify.clone(),
                orcpt: orcpt.clone(),
            })
            .collect();

        let framed = self.framed.as_mut().ok_or_else(no_transport)?;

        // MAIL FROM and every RCPT TO are answered strictly in order; all
        // outstanding replies are read before deciding.
        let (mail_reply, rcpt_replies) = if pipelining {
            framed.queue_command(&mail);
            for rcpt in &rcpts {
                framed.queue_command(rcpt);
            }
            self.in_transaction = true;
            framed.flush_queued().await?;

            let mail_reply = framed.read_reply().await?;
            let mut replies = Vec::with_capacity(rcpts.len());
            for _ in &rcpts {
                replies.push(framed.read_reply().await?);
            }
            (mail_reply, replies)
        } else {
            self.in_transaction = true;
            let mail_reply = command(framed, &mail).await?;
            let mut replies = Vec::with_capacity(rcpts.len());
            if mail_reply.is_success() {
                for rcpt in &rcpts {
                    replies.push(command(framed, rcpt).await?);
                }
            }
            (mail_reply, replies)
        };

        if !mail_reply.is_success() {
            return Err(Error::Envelope {
                code: Some(mail_reply.code.as_u16()),
                message: mail_reply.message_text(),
                rejected: rejected_errors,
            });
        }

        let mut accepted = Vec::with_capacity(valid.len());
        let mut last_rejection = None;
        for (rcpt, reply) in valid.into_iter().zip(rcpt_replies) {
            if reply.is_success() {
                accepted.push(rcpt);
            } else {
                last_rejection = Some(reply.code.as_u16());
                rejected_errors.push(RecipientError::from_reply(rcpt, &reply));
            }
        }

        if accepted.is_empty() {
            return Err(Error::Envelope {
                code: last_rejection,
                message: "All recipients were rejected".to_string(),
                rejected: rejected_errors,
            });
        }

        let envelope_time = started.elapsed();
        let data_started = Instant::now();

        let reply = command(framed, &Command::Data).await?;
        if reply.code != ReplyCode::START_DATA {
            return Err(Error::message(
                Some(reply.code.as_u16()),
                reply.message_text(),
            ));
        }

        let mut stuffer = DotStuffer::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut out = BytesMut::with_capacity(CHUNK_SIZE + CHUNK_SIZE / 8);
        loop {
            let n = match message.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    return Err(Error::MessageStream {
                        source,
                        bytes_sent: stuffer.bytes_out(),
                    });
                }
            };
            let bytes = &chunk[..n];
            if !allow_8bit && contains_8bit(bytes) {
                return Err(Error::Protocol(
                    "message contains 8-bit data but 8BITMIME was not negotiated".to_string(),
                ));
            }
            out.clear();
            stuffer.encode(bytes, &mut out);
            framed.write_all(&out).await?;
        }
        out.clear();
        stuffer.finish(&mut out);
        framed.write_all(&out).await?;
        trace!(cid = self.id, "C: <{} body bytes>", stuffer.bytes_out());

        let response = if self.options.lmtp {
            let mut delivered = Vec::with_capacity(accepted.len());
            let mut response = String::new();
            let mut last_failure = None;
            for rcpt in accepted {
                let reply = framed.read_reply().await?;
                if reply.is_success() {
                    response = reply.to_string();
                    delivered.push(rcpt);
                } else {
                    last_failure = Some(reply.code.as_u16());
                    rejected_errors.push(RecipientError::from_reply(rcpt, &reply));
                }
            }
            self.in_transaction = false;
            accepted = delivered;
            if accepted.is_empty() {
                return Err(Error::Envelope {
                    code: last_failure,
                    message: "Message was rejected for every recipient".to_string(),
                    rejected: rejected_errors,
                });
            }
            response
        } else {
            let reply = framed.read_reply().await?;
            self.in_transaction = false;
            if !reply.is_success() {
                return Err(Error::message(
                    Some(reply.code.as_u16()),
                    reply.message_text(),
                ));
            }
            reply.to_string()
        };

        debug!(
            cid = self.id,
            accepted = accepted.len(),
            rejected = rejected_errors.len(),
            size = stuffer.bytes_out(),
            "message sent"
        );

        Ok(SendInfo {
            rejected: rejected_errors
                .iter()
                .map(|e| e.recipient.clone())
                .collect(),
            accepted,
            rejected_errors,
            envelope_time,
            message_time: data_started.elapsed(),
            message_size: stuffer.bytes_out(),
            response,
            message_id: None,
            connection_id: self.id,
        })
    }

    /// Sends RSET, returning to `Ready`.
    ///
    /// # Errors
    ///
    /// A failed RSET leaves the connection `Errored`.
    pub async fn reset(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Ready, "reset")?;
        match self.rset().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn rset(&mut self) -> Result<()> {
        let reply = command(self.framed_mut()?, &Command::Rset).await?;
        if !reply.is_success() {
            return Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()));
        }
        self.in_transaction = false;
        Ok(())
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Any failure leaves the connection `Errored`.
    pub async fn noop(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Ready, "noop")?;
        let result = async {
            let reply = command(self.framed_mut()?, &Command::Noop).await?;
            if reply.is_success() {
                Ok(())
            } else {
                Err(Error::smtp_error(reply.code.as_u16(), reply.message_text()))
            }
        }
        .await;
        self.record(result)
    }

    /// Waits until the peer sends something unsolicited or closes.
    ///
    /// Cancel-safe: nothing is consumed, so it can race other events in a
    /// `select!`. Follow up with [`Connection::take_idle_error`].
    pub async fn wait_for_close(&mut self) {
        if self.state != ConnectionState::Ready {
            return;
        }
        if let Some(framed) = self.framed.as_mut() {
            let _ = framed.peer_activity().await;
        }
    }

    /// Consumes whatever ended an idle wait and fails the connection.
    pub async fn take_idle_error(&mut self) -> Error {
        let err = match self.framed.as_mut() {
            Some(framed) => match framed.read_reply().await {
                Ok(reply) => Error::smtp_error(reply.code.as_u16(), reply.message_text()),
                Err(err) => err,
            },
            None => Error::ConnectionClosed,
        };
        self.fail(err)
    }

    /// Sends QUIT if connected and drops the transport. Idempotent.
    pub async fn close(&mut self) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing => return,
            ConnectionState::Errored => {
                self.framed = None;
                return;
            }
            _ => {}
        }

        self.state = ConnectionState::Closing;
        if let Some(mut framed) = self.framed.take() {
            let quit = tokio::time::timeout(QUIT_TIMEOUT, async {
                command(&mut framed, &Command::Quit).await
            })
            .await;
            match quit {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(cid = self.id, error = %err, "QUIT failed"),
                Err(_) => warn!(cid = self.id, "QUIT timed out"),
            }
            framed.shutdown().await;
        }
        self.state = ConnectionState::Closed;
        debug!(cid = self.id, "closed");
    }

    /// Marks the connection failed and drops the transport.
    pub fn fail(&mut self, err: Error) -> Error {
        if self.state != ConnectionState::Errored {
            debug!(cid = self.id, state = %self.state, error = %err, "connection failed");
        }
        self.state = ConnectionState::Errored;
        self.framed = None;
        self.in_transaction = false;
        err
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_fatal() => Err(self.fail(err)),
            other => other,
        }
    }

    fn expect_state(&self, expected: ConnectionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{operation} requires {expected}, connection is {}",
                self.state
            )))
        }
    }

    fn framed_mut(&mut self) -> Result<&mut FramedStream> {
        self.framed.as_mut().ok_or_else(no_transport)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.options.host)
            .field("state", &self.state)
            .field("secure", &self.secure)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

fn no_transport() -> Error {
    Error::InvalidState("connection has no transport".to_string())
}

async fn command(framed: &mut FramedStream, command: &Command) -> Result<Reply> {
    framed.send_command(command).await?;
    framed.read_reply().await
}
