//! Slot worker: one task per pooled connection.

use std::sync::Arc;

use sendpool_smtp::{Connection, ConnectionOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Task;
use crate::error::Error;

/// Slot identifier, unique within one pool.
pub(crate) type SlotId = u64;

/// Why a slot worker stopped.
#[derive(Debug)]
pub(crate) enum Exit {
    /// Reached the message ceiling.
    Retired,
    /// Sat idle for the inactivity timeout.
    Expired,
    /// The job channel closed.
    Closed,
    /// The connection failed during a send.
    Failed,
    /// The connection failed while idle.
    Lost(sendpool_smtp::Error),
}

/// Worker to scheduler messages.
pub(crate) enum Report {
    /// Connection established; the slot can take work.
    Ready { slot: SlotId, connection_id: u64 },
    /// Connect, handshake, upgrade or authentication failed.
    SetupFailed {
        slot: SlotId,
        error: sendpool_smtp::Error,
    },
    /// A send finished and the slot is idle again.
    Completed { slot: SlotId },
    /// The worker stopped. Tasks it never started are handed back.
    Gone {
        slot: SlotId,
        exit: Exit,
        undelivered: Vec<Task>,
    },
}

pub(crate) struct SlotWorker {
    pub(crate) id: SlotId,
    pub(crate) options: Arc<ConnectionOptions>,
    pub(crate) max_messages: usize,
    pub(crate) jobs: mpsc::UnboundedReceiver<Task>,
    pub(crate) reports: mpsc::UnboundedSender<Report>,
}

impl SlotWorker {
    pub(crate) async fn run(mut self) {
        let slot = self.id;
        let mut conn = Connection::new(Arc::clone(&self.options));
        debug!(slot, cid = conn.id(), "opening slot");

        if let Err(error) = conn.establish().await {
            warn!(slot, cid = conn.id(), error = %error, "slot setup failed");
            conn.close().await;
            self.jobs.close();
            let _ = self.reports.send(Report::SetupFailed { slot, error });
            return;
        }
        let _ = self.reports.send(Report::Ready {
            slot,
            connection_id: conn.id(),
        });

        let exit = self.serve(&mut conn).await;
        match &exit {
            Exit::Retired | Exit::Expired | Exit::Closed => conn.close().await,
            Exit::Failed | Exit::Lost(_) => {}
        }
        debug!(slot, cid = conn.id(), exit = ?exit, "slot finished");

        self.jobs.close();
        let mut undelivered = Vec::new();
        while let Ok(task) = self.jobs.try_recv() {
            undelivered.push(task);
        }
        let _ = self.reports.send(Report::Gone {
            slot,
            exit,
            undelivered,
        });
    }

    async fn serve(&mut self, conn: &mut Connection) -> Exit {
        let slot = self.id;
        let idle_timeout = self.options.socket_timeout;
        let mut sent = 0usize;

        loop {
            // A pending close is seen before the next job.
            tokio::select! {
                biased;
                () = conn.wait_for_close() => {
                    let error = conn.take_idle_error().await;
                    warn!(slot, cid = conn.id(), error = %error, "idle connection lost");
                    return Exit::Lost(error);
                }
                job = self.jobs.recv() => {
                    let Some(task) = job else {
                        return Exit::Closed;
                    };
                    let Task { mail, reply } = task;
                    let (envelope, message_id, source) = mail.into_parts();

                    let result = conn
                        .send(&envelope, source)
                        .await
                        .map(|mut info| {
                            info.message_id = message_id;
                            info
                        })
                        .map_err(Error::from);
                    sent += 1;
                    let _ = reply.send(result);

                    if !conn.is_ready() {
                        warn!(slot, cid = conn.id(), "connection failed during send, discarding slot");
                        return Exit::Failed;
                    }
                    if sent >= self.max_messages {
                        debug!(slot, cid = conn.id(), sent, "message ceiling reached, recycling");
                        return Exit::Retired;
                    }
                    let _ = self.reports.send(Report::Completed { slot });
                }
                () = tokio::time::sleep(idle_timeout) => {
                    debug!(slot, cid = conn.id(), "idle timeout, closing slot");
                    return Exit::Expired;
                }
            }
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
    use std::time::Duration;

    use sendpool_smtp::testing::{MockConfig, MockServer};
    use sendpool_smtp::Envelope;

    use super::*;
    use crate::Mail;

    #[tokio::test]
    async fn test_pending_close_wins_over_queued_job() {
        let server = MockServer::new(MockConfig {
            idle_close_after: Some(Duration::from_millis(20)),
            ..MockConfig::default()
        });
        let options = Arc::new(
            ConnectionOptions::builder("mock.example.net")
                .name("client.example.org")
                .socket_provider(server.provider())
                .build(),
        );
        let mut conn = Connection::new(Arc::clone(&options));
        conn.establish().await.unwrap();
        // Returns once the 421 is buffered.
        conn.wait_for_close().await;

        let (jobs_tx, jobs) = mpsc::unbounded_channel();
        let (reports, mut reports_rx) = mpsc::unbounded_channel();
        let mut worker = SlotWorker {
            id: 1,
            options,
            max_messages: 10,
            jobs,
            reports,
        };
        let envelope = Envelope::new("a@valid.sender", ["b@valid.recipient"]);
        let (task, _handle) = Task::new(Mail::from_bytes(envelope, "Subject: x\r\n\r\nbody\r\n"));
        jobs_tx.send(task).unwrap();

        match worker.serve(&mut conn).await {
            Exit::Lost(error) => assert_eq!(error.response_code(), Some(421)),
            other => panic!("expected a lost connection, got {other:?}"),
        }
        // The job was never started and stays queued for another slot.
        assert!(worker.jobs.try_recv().is_ok());
        assert!(reports_rx.try_recv().is_err());
    }
}
