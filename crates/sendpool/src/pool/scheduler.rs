//! Pool scheduler task.
//!
//! Owns the slot table, the FIFO queue and the rate limiter. Dispatch
//! decisions and token grants happen in the same step, so the limiter sees
//! every dispatch exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sendpool_smtp::ConnectionOptions;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::slot::{Exit, Report, SlotId, SlotWorker};
use super::{PoolEvent, PoolSettings, PoolStatus, Task};
use crate::error::Error;
use crate::rate_limiter::RateLimiter;

/// Caller to scheduler messages.
pub(crate) enum Request {
    Send(Task),
    Close(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Connecting,
    Idle,
    Busy,
    /// Job channel dropped; waiting for the worker to report `Gone`.
    Draining,
}

struct Slot {
    state: SlotState,
    jobs: Option<mpsc::UnboundedSender<Task>>,
    connection_id: Option<u64>,
}

pub(crate) struct Scheduler {
    options: Arc<ConnectionOptions>,
    settings: PoolSettings,
    requests: mpsc::UnboundedReceiver<Request>,
    requests_open: bool,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports: mpsc::UnboundedReceiver<Report>,
    events: broadcast::Sender<PoolEvent>,
    status: watch::Sender<PoolStatus>,
    slots: HashMap<SlotId, Slot>,
    idle: VecDeque<SlotId>,
    queue: VecDeque<Task>,
    limiter: Option<RateLimiter>,
    rate_wake: Option<Instant>,
    next_slot: SlotId,
    closing: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    became_idle: bool,
}

impl Scheduler {
    pub(crate) fn new(
        options: Arc<ConnectionOptions>,
        settings: PoolSettings,
        requests: mpsc::UnboundedReceiver<Request>,
        events: broadcast::Sender<PoolEvent>,
        status: watch::Sender<PoolStatus>,
    ) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        Self {
            options,
            limiter: settings
                .rate_limit
                .map(|limit| RateLimiter::new(limit, settings.rate_delta)),
            settings,
            requests,
            requests_open: true,
            reports_tx,
            reports,
            events,
            status,
            slots: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            rate_wake: None,
            next_slot: 1,
            closing: false,
            close_waiters: Vec::new(),
            became_idle: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(
            host = %self.options.host,
            max_connections = self.settings.max_connections,
            max_messages = self.settings.max_messages,
            rate_limit = ?self.settings.rate_limit,
            "pool started"
        );

        loop {
            self.dispatch();
            self.publish();

            if self.closing && self.slots.is_empty() {
                break;
            }

            let wake = self.rate_wake;
            tokio::select! {
                request = self.requests.recv(), if self.requests_open => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        self.requests_open = false;
                        self.begin_close();
                    }
                },
                Some(report) = self.reports.recv() => self.on_report(report),
                () = sleep_until(wake), if wake.is_some() => {}
            }
        }

        info!(host = %self.options.host, "pool closed");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        // Late requests race the shutdown; answer them too.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Send(task) => task.complete(Err(Error::PoolClosed)),
                Request::Close(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Send(task) => {
                if self.closing {
                    task.complete(Err(Error::PoolClosed));
                } else {
                    self.queue.push_back(task);
                }
            }
            Request::Close(done) => {
                self.close_waiters.push(done);
                self.begin_close();
            }
        }
    }

    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let queued = self.queue.len();
        for task in self.queue.drain(..) {
            task.complete(Err(Error::PoolClosed));
        }
        self.idle.clear();
        for slot in self.slots.values_mut() {
            // Dropping the sender ends the worker after its current send.
            slot.jobs = None;
            slot.state = SlotState::Draining;
        }
        info!(
            host = %self.options.host,
            queued,
            live = self.slots.len(),
            "closing pool"
        );
    }

    fn on_report(&mut self, report: Report) {
        match report {
            Report::Ready {
                slot,
                connection_id,
            } => {
                if let Some(entry) = self.slots.get_mut(&slot) {
                    entry.connection_id = Some(connection_id);
                    if entry.state == SlotState::Connecting {
                        entry.state = SlotState::Idle;
                        self.idle.push_back(slot);
                        self.became_idle = true;
                        debug!(slot, cid = connection_id, "slot ready");
                    }
                }
            }
            Report::Completed { slot } => {
                if let Some(entry) = self.slots.get_mut(&slot) {
                    if entry.state == SlotState::Busy {
                        entry.state = SlotState::Idle;
                        self.idle.push_back(slot);
                        self.became_idle = true;
                    }
                }
            }
            Report::SetupFailed { slot, error } => {
                self.slots.remove(&slot);
                warn!(
                    slot,
                    error = %error,
                    queued = self.queue.len(),
                    "discarding slot after setup failure"
                );
                match self.queue.pop_front() {
                    Some(task) => task.complete(Err(Error::from(error))),
                    None => {
                        let _ = self.events.send(PoolEvent::Error(Arc::new(error)));
                    }
                }
            }
            Report::Gone {
                slot,
                exit,
                undelivered,
            } => {
                if let Some(entry) = self.slots.remove(&slot) {
                    debug!(
                        slot,
                        cid = ?entry.connection_id,
                        exit = ?exit,
                        live = self.slots.len(),
                        "slot removed"
                    );
                }
                self.idle.retain(|&id| id != slot);
                for task in undelivered.into_iter().rev() {
                    if self.closing {
                        task.complete(Err(Error::PoolClosed));
                    } else {
                        self.queue.push_front(task);
                    }
                }
                if let Exit::Lost(error) = exit {
                    let _ = self.events.send(PoolEvent::Error(Arc::new(error)));
                }
            }
        }
    }

    fn dispatch(&mut self) {
        self.rate_wake = None;
        if self.closing {
            return;
        }

        while !self.queue.is_empty() && !self.idle.is_empty() {
            if let Some(limiter) = self.limiter.as_mut() {
                let now = Instant::now();
                if let Err(wait) = limiter.try_acquire(now) {
                    self.rate_wake = Some(now + wait);
                    break;
                }
            }
            let (Some(slot), Some(task)) = (self.idle.pop_front(), self.queue.pop_front()) else {
                break;
            };
            self.assign(slot, task);
        }

        let connecting = self
            .slots
            .values()
            .filter(|slot| slot.state == SlotState::Connecting)
            .count();
        let mut wanted = self
            .queue
            .len()
            .saturating_sub(connecting + self.idle.len());
        while wanted > 0 && self.slots.len() < self.settings.max_connections {
            self.spawn_slot();
            wanted -= 1;
        }

        if self.became_idle {
            self.became_idle = false;
            if !self.idle.is_empty() {
                let _ = self.events.send(PoolEvent::Idle);
            }
        }
    }

    fn assign(&mut self, slot: SlotId, task: Task) {
        let Some(entry) = self.slots.get_mut(&slot) else {
            self.queue.push_front(task);
            return;
        };
        let Some(jobs) = entry.jobs.as_ref() else {
            self.queue.push_front(task);
            return;
        };
        match jobs.send(task) {
            Ok(()) => entry.state = SlotState::Busy,
            Err(mpsc::error::SendError(task)) => {
                // The worker is exiting; its `Gone` report follows.
                entry.state = SlotState::Draining;
                self.queue.push_front(task);
            }
        }
    }

    fn spawn_slot(&mut self) {
        let id = self.next_slot;
        self.next_slot += 1;
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        self.slots.insert(
            id,
            Slot {
                state: SlotState::Connecting,
                jobs: Some(jobs),
                connection_id: None,
            },
        );
        debug!(slot = id, live = self.slots.len(), "creating slot");

        let worker = SlotWorker {
            id,
            options: Arc::clone(&self.options),
            max_messages: self.settings.max_messages,
            jobs: jobs_rx,
            reports: self.reports_tx.clone(),
        };
        tokio::spawn(worker.run());
    }

    fn publish(&self) {
        let mut status = PoolStatus {
            live: self.slots.len(),
            queued: self.queue.len(),
            max_connections: self.settings.max_connections,
            closed: self.closing,
            ..PoolStatus::default()
        };
        for slot in self.slots.values() {
            match slot.state {
                SlotState::Connecting => status.connecting += 1,
                SlotState::Idle => status.idle += 1,
                SlotState::Busy => status.busy += 1,
                SlotState::Draining => {}
            }
        }
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
