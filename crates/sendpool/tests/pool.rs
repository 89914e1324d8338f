//! Pool scheduling tests against the in-memory SMTP server.

#![allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sendpool::{Error, Mail, Pool, PoolEvent, PoolSettings, PoolStatus};
use sendpool_smtp::testing::{MockConfig, MockServer};
use sendpool_smtp::{ConnectionOptions, Credentials, Envelope};

fn pool(server: &Arc<MockServer>, settings: PoolSettings) -> Pool {
    pool_with(server, settings, |builder| builder)
}

/// Routes pool logs to the test output; `RUST_LOG=sendpool=debug` shows
/// slot lifecycle.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pool_with(
    server: &Arc<MockServer>,
    settings: PoolSettings,
    configure: impl FnOnce(
        sendpool_smtp::ConnectionOptionsBuilder,
    ) -> sendpool_smtp::ConnectionOptionsBuilder,
) -> Pool {
    init_tracing();
    let options = configure(
        ConnectionOptions::builder("mock.example.net")
            .name("client.example.org")
            .socket_provider(server.provider()),
    )
    .build();
    Pool::new(Arc::new(options), settings)
}

fn settings(max_connections: usize, max_messages: usize) -> PoolSettings {
    PoolSettings {
        max_connections,
        max_messages,
        ..PoolSettings::default()
    }
}

fn mail(n: usize) -> Mail {
    let envelope = Envelope::new("a@valid.sender", [format!("rcpt{n}@valid.recipient")]);
    Mail::from_bytes(envelope, format!("Subject: message {n}\r\n\r\nbody {n}\r\n"))
        .with_message_id(format!("<{n}@valid.sender>"))
}

async fn wait_for_status(pool: &Pool, check: impl Fn(&PoolStatus) -> bool) -> PoolStatus {
    for _ in 0..500 {
        let status = pool.status();
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached the expected status: {:?}", pool.status());
}

#[tokio::test]
async fn burst_never_exceeds_max_connections() {
    let server = MockServer::standard();
    let pool = pool(&server, settings(3, 100));

    let handles: Vec<_> = (0..20).map(|n| pool.submit(mail(n))).collect();
    for (n, handle) in handles.into_iter().enumerate() {
        let info = handle.await.unwrap();
        assert_eq!(info.accepted, vec![format!("rcpt{n}@valid.recipient")]);
        assert_eq!(info.message_id, Some(format!("<{n}@valid.sender>")));
    }

    assert_eq!(server.deliveries().len(), 20);
    assert!(server.peak_live() <= 3);
    assert!(server.connections() <= 3);
    assert!(pool.status().live <= 3);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limit_is_pool_wide() {
    let server = MockServer::standard();
    let pool = pool(
        &server,
        PoolSettings {
            max_connections: 3,
            rate_limit: Some(2),
            rate_delta: Duration::from_secs(1),
            ..PoolSettings::default()
        },
    );

    let started = tokio::time::Instant::now();
    let handles: Vec<_> = (0..6).map(|n| pool.submit(mail(n))).collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut times: Vec<_> = server.deliveries().iter().map(|d| d.at).collect();
    times.sort();
    assert_eq!(times.len(), 6);
    for pair in times.windows(3) {
        assert!(pair[2] - pair[0] >= Duration::from_secs(1));
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    pool.close().await;
}

#[tokio::test]
async fn slot_is_replaced_after_max_messages() {
    let server = MockServer::standard();
    let pool = pool(&server, settings(1, 2));

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(pool.send(mail(n)).await.unwrap().connection_id);
    }

    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_eq!(ids[2], ids[3]);
    assert_ne!(ids[3], ids[4]);
    assert_eq!(server.connections(), 3);
    assert_eq!(server.peak_live(), 1);

    // Retired connections say goodbye.
    let sessions = server.sessions();
    assert_eq!(sessions[0].lines().last().unwrap(), "QUIT");
    assert_eq!(sessions[1].lines().last().unwrap(), "QUIT");
    pool.close().await;
}

#[tokio::test]
async fn single_connection_serializes_sends() {
    let server = MockServer::new(MockConfig {
        delivery_delay: Some(Duration::from_millis(30)),
        ..MockConfig::default()
    });
    let pool = pool(&server, settings(1, 100));
    let order = Arc::new(Mutex::new(Vec::new()));

    let run = |n: usize| {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        async move {
            let info = pool.send(mail(n)).await.unwrap();
            order.lock().unwrap().push(n);
            info.connection_id
        }
    };
    let first = tokio::spawn(run(1));
    tokio::task::yield_now().await;
    let second = tokio::spawn(run(2));

    let (a, b) = (first.await.unwrap(), second.await.unwrap());
    assert_eq!(a, b);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert_eq!(server.peak_live(), 1);

    let deliveries = server.deliveries();
    assert_eq!(deliveries[0].to, vec!["rcpt1@valid.recipient".to_string()]);
    assert!(deliveries[1].at >= deliveries[0].at);
    pool.close().await;
}

#[tokio::test]
async fn peer_close_mid_data_discards_slot() {
    let server = MockServer::new(MockConfig {
        close_during_data: true,
        ..MockConfig::default()
    });
    let pool = pool(&server, settings(2, 100));

    let err = pool.send(mail(1)).await.unwrap_err();
    assert!(err.as_smtp().unwrap().is_fatal());
    wait_for_status(&pool, |s| s.live == 0).await;

    // The next send gets a fresh connection; the failure is not retried.
    let _ = pool.send(mail(2)).await;
    assert_eq!(server.connections(), 2);
    assert!(server.deliveries().is_empty());
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn close_fails_queued_sends_and_is_idempotent() {
    let server = MockServer::new(MockConfig {
        delivery_delay: Some(Duration::from_secs(5)),
        ..MockConfig::default()
    });
    let pool = pool(&server, settings(1, 100));

    let first = pool.submit(mail(1));
    let second = pool.submit(mail(2));
    let third = pool.submit(mail(3));
    wait_for_status(&pool, |s| s.busy == 1 && s.queued == 2).await;

    pool.close().await;
    pool.close().await;

    // In flight when close ran: finishes normally.
    let info = first.await.unwrap();
    assert_eq!(info.accepted.len(), 1);
    assert!(matches!(second.await, Err(Error::PoolClosed)));
    assert!(matches!(third.await, Err(Error::PoolClosed)));

    assert!(matches!(pool.send(mail(4)).await, Err(Error::PoolClosed)));
    assert!(!pool.is_idle());
    assert_eq!(server.live(), 0);
    assert_eq!(server.deliveries().len(), 1);
}

#[tokio::test]
async fn idle_event_after_send() {
    let server = MockServer::standard();
    let pool = pool(&server, settings(2, 100));
    assert!(pool.is_idle());
    let mut events = pool.subscribe();

    pool.send(mail(1)).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, PoolEvent::Idle));
    wait_for_status(&pool, |s| s.idle == 1).await;
    assert!(pool.is_idle());
    pool.close().await;
}

#[tokio::test]
async fn idle_connection_loss_emits_error() {
    let server = MockServer::new(MockConfig {
        idle_close_after: Some(Duration::from_millis(50)),
        ..MockConfig::default()
    });
    let pool = pool(&server, settings(2, 100));
    let mut events = pool.subscribe();

    pool.send(mail(1)).await.unwrap();

    let error = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let PoolEvent::Error(error) = events.recv().await.unwrap() {
                return error;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(error.response_code(), Some(421));
    wait_for_status(&pool, |s| s.live == 0).await;

    // Replaced on demand, not eagerly.
    assert_eq!(server.connections(), 1);
    pool.send(mail(2)).await.unwrap();
    assert_eq!(server.connections(), 2);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn idle_slot_expires_after_socket_timeout() {
    let server = MockServer::standard();
    let pool = pool_with(&server, settings(2, 100), |builder| {
        builder.socket_timeout(Duration::from_secs(60))
    });

    pool.send(mail(1)).await.unwrap();
    wait_for_status(&pool, |s| s.idle == 1).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_for_status(&pool, |s| s.live == 0).await;
    assert_eq!(server.sessions()[0].lines().last().unwrap(), "QUIT");
    pool.close().await;
}

#[tokio::test]
async fn setup_failure_goes_to_oldest_task() {
    let server = MockServer::standard();
    let pool = pool_with(&server, settings(1, 100), |builder| {
        builder.credentials(Credentials::new("user", "wrong"))
    });

    let first = pool.submit(mail(1));
    let second = pool.submit(mail(2));

    let err = first.await.unwrap_err();
    assert_eq!(err.code(), "EAUTH");
    let err = second.await.unwrap_err();
    assert_eq!(err.code(), "EAUTH");

    // One connection attempt per failed task, never more than the limit.
    assert_eq!(server.connections(), 2);
    assert_eq!(server.peak_live(), 1);
    assert!(server.deliveries().is_empty());
    pool.close().await;
}

#[tokio::test]
async fn dropping_every_handle_closes_the_pool() {
    let server = MockServer::standard();
    let pool = pool(&server, settings(1, 100));
    pool.send(mail(1)).await.unwrap();
    drop(pool);

    for _ in 0..500 {
        if server.live() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection was not closed");
}
