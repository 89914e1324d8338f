//! Connection pool.
//!
//! A [`Pool`] is a handle to a scheduler task that owns the slot table, the
//! pending queue and the [`RateLimiter`](crate::RateLimiter). Each slot is a
//! worker task owning one [`Connection`](sendpool_smtp::Connection):
//!
//! ```text
//! Pool::submit ──Request──► scheduler ──Task──► slot worker ──► Connection
//!                              ▲                    │
//!                              └──────Report────────┘
//! ```
//!
//! Only the scheduler mutates pool state; workers report lifecycle changes
//! over a channel.

mod scheduler;
mod slot;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use sendpool_smtp::{ConnectionOptions, SendInfo};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGES, DEFAULT_RATE_DELTA, TransportConfig};
use crate::error::{Error, Result};
use crate::mail::Mail;

use scheduler::{Request, Scheduler};

const EVENT_CAPACITY: usize = 64;

/// Pool sizing and throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on live connections.
    pub max_connections: usize,
    /// Messages per connection before it is replaced.
    pub max_messages: usize,
    /// Dispatches per `rate_delta`; `None` is unlimited.
    pub rate_limit: Option<usize>,
    /// Rate-limit window.
    pub rate_delta: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_messages: DEFAULT_MAX_MESSAGES,
            rate_limit: None,
            rate_delta: DEFAULT_RATE_DELTA,
        }
    }
}

impl From<&TransportConfig> for PoolSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_messages: config.max_messages,
            rate_limit: config.rate_limit,
            rate_delta: config.rate_delta,
        }
    }
}

/// Pool notifications.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A slot became available for work.
    Idle,
    /// An idle connection failed; the slot was discarded.
    Error(Arc<sendpool_smtp::Error>),
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live slots, including ones still connecting.
    pub live: usize,
    /// Slots still connecting.
    pub connecting: usize,
    /// Slots waiting for work.
    pub idle: usize,
    /// Slots running a send.
    pub busy: usize,
    /// Tasks waiting for a slot.
    pub queued: usize,
    /// Configured live slot limit.
    pub max_connections: usize,
    /// `close` has been called.
    pub closed: bool,
}

impl PoolStatus {
    /// True if a send submitted now could start without waiting for another
    /// send to finish: a slot is idle, or there is unused capacity and
    /// nothing queued.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        !self.closed
            && (self.idle > 0 || (self.live < self.max_connections && self.queued == 0))
    }
}

/// Result of a submitted send.
///
/// Resolves exactly once. If the worker carrying the message disappears
/// without reporting, resolves to [`Error::Aborted`].
#[derive(Debug)]
#[must_use = "a SendHandle does nothing unless awaited"]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<SendInfo>>,
}

impl SendHandle {
    pub(crate) const fn new(rx: oneshot::Receiver<Result<SendInfo>>) -> Self {
        Self { rx }
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(result: Result<SendInfo>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for SendHandle {
    type Output = Result<SendInfo>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Aborted)))
    }
}

/// A message waiting for, or assigned to, a slot.
pub(crate) struct Task {
    pub(crate) mail: Mail,
    pub(crate) reply: oneshot::Sender<Result<SendInfo>>,
}

impl Task {
    fn new(mail: Mail) -> (Self, SendHandle) {
        let (reply, rx) = oneshot::channel();
        (Self { mail, reply }, SendHandle::new(rx))
    }

    /// Completes the task's callback.
    pub(crate) fn complete(self, result: Result<SendInfo>) {
        // The caller may have dropped its handle.
        let _ = self.reply.send(result);
    }
}

/// Handle to a connection pool.
///
/// Cloning is cheap; every clone drives the same scheduler. The pool closes
/// itself once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Pool {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<PoolEvent>,
    status: watch::Receiver<PoolStatus>,
}

impl Pool {
    /// Starts a pool. Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(options: Arc<ConnectionOptions>, settings: PoolSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(options, settings, events)
    }

    pub(crate) fn with_events(
        options: Arc<ConnectionOptions>,
        settings: PoolSettings,
        events: broadcast::Sender<PoolEvent>,
    ) -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PoolStatus {
            max_connections: settings.max_connections,
            ..PoolStatus::default()
        });
        let scheduler = Scheduler::new(options, settings, requests_rx, events.clone(), status_tx);
        tokio::spawn(scheduler.run());
        Self {
            requests,
            events,
            status,
        }
    }

    /// Queues a message and returns a handle to its result.
    pub fn submit(&self, mail: Mail) -> SendHandle {
        let (task, handle) = Task::new(mail);
        if let Err(mpsc::error::SendError(Request::Send(task))) =
            self.requests.send(Request::Send(task))
        {
            task.complete(Err(Error::PoolClosed));
        }
        handle
    }

    /// Sends a message and waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the connection's error for this message, or
    /// [`Error::PoolClosed`] if the pool closed before dispatching it.
    pub async fn send(&self, mail: Mail) -> Result<SendInfo> {
        self.submit(mail).await
    }

    /// True if a slot is idle or can be created for new work.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status.borrow().is_idle()
    }

    /// Current occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    /// Subscribes to pool events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Stops accepting sends, fails queued ones with
    /// [`Error::PoolClosed`] and closes every connection once its current
    /// send, if any, finishes. Idempotent.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.requests.send(Request::Close(done)).is_ok() {
            // An error means the scheduler already finished.
            let _ = wait.await;
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
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_handle_pending_until_completed() {
        let (tx, rx) = oneshot::channel();
        let mut handle = task::spawn(SendHandle::new(rx));
        assert_pending!(handle.poll());

        tx.send(Err(Error::PoolClosed)).unwrap();
        assert!(handle.is_woken());
        let result = assert_ready!(handle.poll());
        assert!(matches!(result, Err(Error::PoolClosed)));
    }

    #[test]
    fn test_handle_aborted_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<Result<SendInfo>>();
        let mut handle = task::spawn(SendHandle::new(rx));
        assert_pending!(handle.poll());

        drop(tx);
        let result = assert_ready!(handle.poll());
        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[test]
    fn test_ready_handle() {
        let mut handle = task::spawn(SendHandle::ready(Err(Error::PoolClosed)));
        assert!(matches!(assert_ready!(handle.poll()), Err(Error::PoolClosed)));
    }

    #[test]
    fn test_status_is_idle() {
        let fresh = PoolStatus {
            max_connections: 2,
            ..PoolStatus::default()
        };
        assert!(fresh.is_idle());

        let full = PoolStatus {
            live: 2,
            busy: 2,
            max_connections: 2,
            ..PoolStatus::default()
        };
        assert!(!full.is_idle());

        let backlog = PoolStatus {
            live: 1,
            busy: 1,
            queued: 3,
            max_connections: 2,
            ..PoolStatus::default()
        };
        assert!(!backlog.is_idle());

        let spare = PoolStatus {
            idle: 1,
            ..full
        };
        assert!(spare.is_idle());
        assert!(!PoolStatus { closed: true, ..spare }.is_idle());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = TransportConfig::new("mx.example.com");
        config.max_connections = 7;
        config.rate_limit = Some(3);
        let settings = PoolSettings::from(&config);
        assert_eq!(settings.max_connections, 7);
        assert_eq!(settings.max_messages, DEFAULT_MAX_MESSAGES);
        assert_eq!(settings.rate_limit, Some(3));
    }
}
