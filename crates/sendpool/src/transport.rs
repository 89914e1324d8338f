//! SMTP transport facade.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sendpool_smtp::{Connection, ConnectionOptions, SendInfo};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::mail::Mail;
use crate::pool::{Pool, PoolEvent, PoolSettings, PoolStatus, SendHandle};

const EVENT_CAPACITY: usize = 64;

enum Mode {
    Pooled(Pool),
    Direct { closed: AtomicBool },
}

/// Sends mail over SMTP or LMTP.
///
/// In pooled mode every send goes through a [`Pool`]; otherwise each send
/// opens a connection, delivers one message and closes it.
pub struct SmtpTransport {
    options: Arc<ConnectionOptions>,
    mode: Mode,
    events: broadcast::Sender<PoolEvent>,
}

impl SmtpTransport {
    /// Creates a transport. Must be called within a Tokio runtime when
    /// pooling is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let options = Arc::new(config.connection_options());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mode = if config.pool {
            Mode::Pooled(Pool::with_events(
                Arc::clone(&options),
                PoolSettings::from(&config),
                events.clone(),
            ))
        } else {
            Mode::Direct {
                closed: AtomicBool::new(false),
            }
        };
        Ok(Self {
            options,
            mode,
            events,
        })
    }

    /// True when sends go through a pool.
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        matches!(self.mode, Mode::Pooled(_))
    }

    /// Sends a message and waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the connection's error for this message, or
    /// [`Error::PoolClosed`] after [`close`](Self::close).
    pub async fn send(&self, mail: Mail) -> Result<SendInfo> {
        self.submit(mail).await
    }

    /// Starts a send and returns a handle to its result.
    pub fn submit(&self, mail: Mail) -> SendHandle {
        match &self.mode {
            Mode::Pooled(pool) => pool.submit(mail),
            Mode::Direct { closed } => {
                if closed.load(Ordering::Acquire) {
                    return SendHandle::ready(Err(Error::PoolClosed));
                }
                let (tx, rx) = oneshot::channel();
                let options = Arc::clone(&self.options);
                tokio::spawn(async move {
                    let _ = tx.send(send_once(options, mail).await);
                });
                SendHandle::new(rx)
            }
        }
    }

    /// Sends a message and hands the result to `callback`.
    pub fn send_with<F>(&self, mail: Mail, callback: F)
    where
        F: FnOnce(Result<SendInfo>) + Send + 'static,
    {
        let handle = self.submit(mail);
        tokio::spawn(async move { callback(handle.await) });
    }

    /// Checks the configuration: connect, handshake, upgrade, authenticate,
    /// then QUIT.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn verify(&self) -> Result<()> {
        let mut conn = Connection::new(Arc::clone(&self.options));
        let result = conn.establish().await;
        conn.close().await;
        result?;
        debug!(host = %self.options.host, "configuration verified");
        Ok(())
    }

    /// True if a send submitted now would start without waiting.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        match &self.mode {
            Mode::Pooled(pool) => pool.is_idle(),
            Mode::Direct { closed } => !closed.load(Ordering::Acquire),
        }
    }

    /// Pool occupancy, in pooled mode.
    #[must_use]
    pub fn status(&self) -> Option<PoolStatus> {
        match &self.mode {
            Mode::Pooled(pool) => Some(pool.status()),
            Mode::Direct { .. } => None,
        }
    }

    /// Subscribes to pool events. Direct mode emits none.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Stops accepting sends; in pooled mode fails queued ones and closes
    /// every connection. Idempotent.
    pub async fn close(&self) {
        match &self.mode {
            Mode::Pooled(pool) => pool.close().await,
            Mode::Direct { closed } => closed.store(true, Ordering::Release),
        }
    }
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .field("pooled", &self.is_pooled())
            .finish_non_exhaustive()
    }
}

/// Delivers one message over a fresh connection.
async fn send_once(options: Arc<ConnectionOptions>, mail: Mail) -> Result<SendInfo> {
    let (envelope, message_id, source) = mail.into_parts();
    let mut conn = Connection::new(options);
    let result = async {
        conn.establish().await?;
        conn.send(&envelope, source).await
    }
    .await;
    conn.close().await;

    let mut info = result?;
    info.message_id = message_id;
    Ok(info)
}
