#![allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

use super::{Connection, ConnectionOptions, ConnectionOptionsBuilder, ConnectionState};
use crate::auth::{AuthContext, Credentials, CustomAuth};
use crate::error::{Error, ErrorKind, Result, TimeoutPhase};
use crate::testing::{MockConfig, MockServer};
use crate::types::Envelope;

const BODY: &[u8] = b"Subject: test\r\n\r\nHello\r\n.hidden dot\r\n";

fn options(server: &Arc<MockServer>) -> ConnectionOptionsBuilder {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ConnectionOptions::builder("mock.example.net")
        .name("client.example.org")
        .socket_provider(server.provider())
}

async fn ready(builder: ConnectionOptionsBuilder) -> Connection {
    let mut conn = Connection::new(Arc::new(builder.build()));
    conn.establish().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    conn
}

struct FailingReader {
    served: bool,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.served {
            Poll::Ready(Err(io::Error::other("source exploded")))
        } else {
            self.served = true;
            buf.put_slice(b"Subject: partial\r\n");
            Poll::Ready(Ok(()))
        }
    }
}

#[tokio::test]
async fn test_send_with_partial_rejection() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new(
        "sender@example.org",
        ["ok@valid.recipient", "bad@invalid.recipient"],
    );
    let info = conn.send(&envelope, BODY).await.unwrap();

    assert_eq!(info.accepted, vec!["ok@valid.recipient".to_string()]);
    assert_eq!(info.rejected, vec!["bad@invalid.recipient".to_string()]);
    assert_eq!(info.rejected_errors.len(), 1);
    assert_eq!(info.rejected_errors[0].code, Some(550));
    assert!(info.response.starts_with("250"));
    assert_eq!(info.connection_id, conn.id());
    assert_eq!(conn.state(), ConnectionState::Ready);

    let deliveries = server.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].from, "sender@example.org");
    assert_eq!(deliveries[0].body, BODY);
}

#[tokio::test]
async fn test_all_recipients_rejected() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new(
        "sender@example.org",
        ["a@invalid.recipient", "b@invalid.recipient"],
    );
    let err = conn.send(&envelope, BODY).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Envelope);
    assert_eq!(err.rejected().len(), 2);
    assert_eq!(err.response_code(), Some(550));
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(server.sessions()[0].lines().contains(&"RSET".to_string()));

    // Still usable after the reset.
    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    conn.send(&envelope, BODY).await.unwrap();
}

#[tokio::test]
async fn test_locally_invalid_recipients() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("sender@example.org", ["not an address", "@nope"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();

    assert_eq!(err.code(), "EENVELOPE");
    assert_eq!(err.rejected().len(), 2);
    assert!(err.rejected().iter().all(|r| r.code.is_none()));
    assert!(
        !server.sessions()[0]
            .lines()
            .iter()
            .any(|l| l.starts_with("MAIL"))
    );

    let envelope = Envelope::new("sender@example.org", ["bad", "ok@valid.recipient"]);
    let info = conn.send(&envelope, BODY).await.unwrap();
    assert_eq!(info.accepted.len(), 1);
    assert_eq!(info.rejected, vec!["bad".to_string()]);
}

#[tokio::test]
async fn test_sender_rejected() {
    let server = MockServer::new(MockConfig {
        reject_sender_domains: vec!["spam.example".to_string()],
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("someone@spam.example", ["ok@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Envelope);
    assert_eq!(err.response_code(), Some(550));
    assert!(conn.is_ready());
}

#[tokio::test]
async fn test_pipelined_envelope_is_batched() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new(
        "sender@example.org",
        ["one@valid.recipient", "two@valid.recipient"],
    );
    conn.send(&envelope, BODY).await.unwrap();

    let session = &server.sessions()[0];
    let mail = session
        .commands
        .iter()
        .find(|c| c.line.starts_with("MAIL FROM"))
        .unwrap();
    assert!(mail.batched);
    let data = session.commands.iter().find(|c| c.line == "DATA").unwrap();
    assert!(!data.batched);
}

#[tokio::test]
async fn test_helo_fallback_with_forced_auth() {
    let server = MockServer::new(MockConfig {
        ehlo: false,
        ..MockConfig::default()
    });
    let conn = ready(
        options(&server)
            .credentials(Credentials::new("user", "pass"))
            .auth_method("PLAIN"),
    )
    .await;

    assert!(conn.capabilities().is_helo_fallback());
    assert!(conn.is_authenticated());

    let lines = server.sessions()[0].lines();
    assert!(lines[0].starts_with("EHLO client.example.org"));
    assert!(lines[1].starts_with("HELO client.example.org"));
    assert!(lines[2].starts_with("AUTH PLAIN "));
}

#[tokio::test]
async fn test_helo_fallback_sends_sequentially() {
    let server = MockServer::new(MockConfig {
        ehlo: false,
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    conn.send(&envelope, BODY).await.unwrap();

    let session = &server.sessions()[0];
    assert!(session.commands.iter().all(|c| !c.batched));
    assert!(
        session
            .lines()
            .iter()
            .any(|l| l == "MAIL FROM:<sender@example.org>")
    );
}

#[tokio::test]
async fn test_auth_skipped_when_not_advertised() {
    let server = MockServer::new(MockConfig {
        extensions: vec!["PIPELINING".to_string(), "8BITMIME".to_string()],
        ..MockConfig::default()
    });
    let mut conn = Connection::new(Arc::new(
        options(&server)
            .credentials(Credentials::new("user", "pass"))
            .build(),
    ));
    conn.establish().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(!conn.is_authenticated());

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    conn.send(&envelope, BODY).await.unwrap();
    let session = &server.sessions()[0];
    assert!(session.authenticated_as.is_none());
    assert!(!session.lines().iter().any(|l| l.starts_with("AUTH")));
}

#[tokio::test]
async fn test_auth_fails_when_no_advertised_mechanism_fits() {
    let server = MockServer::new(MockConfig {
        extensions: vec!["PIPELINING".to_string(), "AUTH GSSAPI NTLM".to_string()],
        ..MockConfig::default()
    });
    let mut conn = Connection::new(Arc::new(
        options(&server)
            .credentials(Credentials::new("user", "pass"))
            .build(),
    ));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(conn.state(), ConnectionState::Greeted);
}

#[tokio::test]
async fn test_auth_mechanisms() {
    let server = MockServer::new(MockConfig {
        xoauth2_token: Some("ya29.token".to_string()),
        ..MockConfig::default()
    });

    let conn = ready(options(&server).credentials(Credentials::new("user", "pass"))).await;
    assert!(conn.is_authenticated());

    let _ = ready(
        options(&server)
            .credentials(Credentials::new("user", "pass"))
            .auth_method("login"),
    )
    .await;

    let _ = ready(options(&server).credentials(Credentials::xoauth2("user", "ya29.token"))).await;

    let sessions = server.sessions();
    assert!(sessions[0].lines().contains(&"AUTH CRAM-MD5".to_string()));
    assert!(sessions[1].lines().contains(&"AUTH LOGIN".to_string()));
    assert!(
        sessions[2]
            .lines()
            .iter()
            .any(|l| l.starts_with("AUTH XOAUTH2 "))
    );
    assert!(
        sessions
            .iter()
            .all(|s| s.authenticated_as.as_deref() == Some("user"))
    );
}

#[tokio::test]
async fn test_auth_failures() {
    let server = MockServer::standard();

    for method in ["PLAIN", "LOGIN", "CRAM-MD5"] {
        let mut conn = Connection::new(Arc::new(
            options(&server)
                .credentials(Credentials::new("user", "wrong"))
                .auth_method(method)
                .build(),
        ));
        let err = conn.establish().await.unwrap_err();
        assert_eq!(err.code(), "EAUTH", "{method}");
        assert_eq!(err.response_code(), Some(535), "{method}");
        assert_eq!(conn.state(), ConnectionState::Greeted);
        assert!(!conn.is_authenticated());
        conn.close().await;
    }

    let mut conn = Connection::new(Arc::new(
        options(&server)
            .credentials(Credentials::xoauth2("user", "expired"))
            .build(),
    ));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

struct TokenAuth {
    payload: &'static str,
}

#[async_trait]
impl CustomAuth for TokenAuth {
    async fn authenticate(&self, ctx: &mut AuthContext<'_>) -> Result<()> {
        assert!(ctx.auth_methods().contains(&"XTOKEN".to_string()));
        let reply = ctx
            .send_command(&format!("AUTH {} {}", ctx.method(), self.payload))
            .await?;
        if reply.is_success() {
            ctx.resolve();
        } else {
            ctx.reject(format!("token refused: {reply}"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_custom_auth() {
    let mut config = MockConfig {
        custom_mechanism: Some(("XTOKEN".to_string(), "secret-token".to_string())),
        ..MockConfig::default()
    };
    config.extensions.push("AUTH XTOKEN".to_string());
    let server = MockServer::new(config);

    let conn = ready(
        options(&server)
            .credentials(Credentials::user_only("svc"))
            .custom_auth(
                "xtoken",
                Arc::new(TokenAuth {
                    payload: "secret-token",
                }),
            ),
    )
    .await;
    assert!(conn.is_authenticated());

    let mut conn = Connection::new(Arc::new(
        options(&server)
            .credentials(Credentials::user_only("svc"))
            .auth_method("XTOKEN")
            .custom_auth("XTOKEN", Arc::new(TokenAuth { payload: "stale" }))
            .build(),
    ));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(err.to_string().contains("token refused"));
}

#[tokio::test]
async fn test_unknown_auth_method() {
    let server = MockServer::standard();
    let mut conn = Connection::new(Arc::new(
        options(&server)
            .credentials(Credentials::new("user", "pass"))
            .auth_method("GSSAPI")
            .build(),
    ));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn test_require_tls_refused() {
    let server = MockServer::standard();
    let mut conn = Connection::new(Arc::new(options(&server).require_tls(true).build()));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.code(), "ETLS");
    assert_eq!(conn.state(), ConnectionState::Errored);
}

#[tokio::test]
async fn test_opportunistic_tls_refused_continues() {
    let server = MockServer::standard();
    let conn = ready(options(&server).opportunistic_tls(true)).await;
    assert!(!conn.is_secure());
    assert!(server.sessions()[0].lines().contains(&"STARTTLS".to_string()));
}

/// Self-signed certificate for the mock host, as server and client configs.
fn tls_pair() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    let cert = rcgen::generate_simple_self_signed(vec!["mock.example.net".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (Arc::new(server), Arc::new(client))
}

#[tokio::test]
async fn test_starttls_upgrade_replaces_capabilities() {
    let (server_tls, client_tls) = tls_pair();
    let server = MockServer::new(MockConfig {
        extensions: vec!["PIPELINING".to_string()],
        tls: Some(server_tls),
        tls_extensions: Some(vec![
            "PIPELINING".to_string(),
            "SIZE 2048".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ]),
        ..MockConfig::default()
    });

    let mut conn = ready(
        options(&server)
            .tls_config(client_tls)
            .credentials(Credentials::new("user", "pass")),
    )
    .await;
    assert!(conn.is_secure());
    assert!(conn.is_authenticated());
    assert!(!conn.capabilities().supports_starttls());
    assert_eq!(conn.capabilities().max_message_size(), Some(2048));

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    conn.send(&envelope, BODY).await.unwrap();
    conn.close().await;

    let session = &server.sessions()[0];
    assert!(session.secured);
    assert_eq!(session.authenticated_as.as_deref(), Some("user"));
    let lines = session.lines();
    let ehlos: Vec<_> = lines.iter().filter(|l| l.starts_with("EHLO")).collect();
    assert_eq!(ehlos.len(), 2);
    let starttls = lines.iter().position(|l| l == "STARTTLS").unwrap();
    let second_ehlo = lines.iter().rposition(|l| l.starts_with("EHLO")).unwrap();
    assert!(starttls < second_ehlo);
    assert_eq!(server.deliveries().len(), 1);
}

#[tokio::test]
async fn test_starttls_refused_is_tls_error() {
    let server = MockServer::new(MockConfig {
        extensions: vec!["PIPELINING".to_string(), "STARTTLS".to_string()],
        ..MockConfig::default()
    });
    let mut conn = Connection::new(Arc::new(options(&server).build()));
    let err = conn.establish().await.unwrap_err();
    assert_eq!(err.code(), "ETLS");
    assert_eq!(err.response_code(), Some(454));
    assert!(matches!(err, Error::StartTlsRefused { .. }));
}

#[tokio::test]
async fn test_ignore_tls_with_require_tls() {
    let server = MockServer::standard();
    let mut conn = Connection::new(Arc::new(
        options(&server).ignore_tls(true).require_tls(true).build(),
    ));
    let err = conn.establish().await.unwrap_err();
    assert!(matches!(err, Error::TlsRequired(_)));
}

#[tokio::test(start_paused = true)]
async fn test_greeting_timeout() {
    let server = MockServer::new(MockConfig {
        silent: true,
        ..MockConfig::default()
    });
    let mut conn = Connection::new(Arc::new(
        options(&server)
            .greeting_timeout(Duration::from_secs(5))
            .build(),
    ));
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Timeout {
            phase: TimeoutPhase::Greeting,
            ..
        }
    ));
    assert_eq!(conn.state(), ConnectionState::Errored);
}

#[tokio::test(start_paused = true)]
async fn test_slow_final_reply_hits_socket_timeout() {
    let server = MockServer::new(MockConfig {
        delivery_delay: Some(Duration::from_secs(120)),
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server).socket_timeout(Duration::from_secs(30))).await;

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.code(), "ETIMEDOUT");
    assert_eq!(conn.state(), ConnectionState::Errored);
}

#[tokio::test]
async fn test_close_during_data() {
    let server = MockServer::new(MockConfig {
        close_during_data: true,
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(conn.state(), ConnectionState::Errored);
    assert!(server.deliveries().is_empty());

    let again = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_final_reply_rejection_keeps_connection() {
    let server = MockServer::new(MockConfig {
        final_reply: Some("554 5.6.0 Message rejected as spam".to_string()),
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.code(), "EMESSAGE");
    assert_eq!(err.response_code(), Some(554));
    assert!(err.is_permanent());
    assert!(conn.is_ready());
}

#[tokio::test]
async fn test_eight_bit_requires_negotiation() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;
    let body = "Subject: caf\u{e9}\r\n\r\nna\u{ef}ve\r\n".as_bytes();

    let plain = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn.send(&plain, body).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(conn.state(), ConnectionState::Errored);

    let mut conn = ready(options(&server)).await;
    let eight_bit = Envelope::builder("sender@example.org")
        .to("ok@valid.recipient")
        .use_8bit(true)
        .build();
    conn.send(&eight_bit, body).await.unwrap();

    let last = server.sessions().pop().unwrap();
    assert!(
        last.lines()
            .contains(&"MAIL FROM:<sender@example.org> BODY=8BITMIME".to_string())
    );
    assert_eq!(server.deliveries()[0].body, body);
}

#[tokio::test]
async fn test_source_error_is_message_stream() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn
        .send(&envelope, FailingReader { served: false })
        .await
        .unwrap_err();
    match err {
        Error::MessageStream { bytes_sent, .. } => assert_eq!(bytes_sent, 18),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Errored);
}

#[tokio::test]
async fn test_size_limit() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    let envelope = Envelope::builder("sender@example.org")
        .to("ok@valid.recipient")
        .size(20 * 1024 * 1024)
        .build();
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Message);
    assert_eq!(err.response_code(), None);
    assert!(conn.is_ready());

    let envelope = Envelope::builder("sender@example.org")
        .to("ok@valid.recipient")
        .size(BODY.len())
        .build();
    conn.send(&envelope, BODY).await.unwrap();
    let lines = server.sessions()[0].lines();
    assert!(lines.iter().any(|l| l.ends_with(&format!("SIZE={}", BODY.len()))));
}

#[tokio::test]
async fn test_lmtp_per_recipient_status() {
    let server = MockServer::new(MockConfig {
        lmtp: true,
        extensions: vec!["PIPELINING".to_string(), "8BITMIME".to_string()],
        lmtp_fail: vec!["full@valid.recipient".to_string()],
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server).lmtp(true)).await;
    assert!(server.sessions()[0].lines()[0].starts_with("LHLO "));

    let envelope = Envelope::new(
        "sender@example.org",
        ["one@valid.recipient", "full@valid.recipient"],
    );
    let info = conn.send(&envelope, BODY).await.unwrap();
    assert_eq!(info.accepted, vec!["one@valid.recipient".to_string()]);
    assert_eq!(info.rejected, vec!["full@valid.recipient".to_string()]);
    assert_eq!(info.rejected_errors[0].code, Some(550));

    let envelope = Envelope::new("sender@example.org", ["full@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Envelope);
    assert!(conn.is_ready());
}

#[tokio::test]
async fn test_idle_server_close() {
    let server = MockServer::new(MockConfig {
        idle_close_after: Some(Duration::from_millis(20)),
        ..MockConfig::default()
    });
    let mut conn = ready(options(&server)).await;

    tokio::time::timeout(Duration::from_secs(5), conn.wait_for_close())
        .await
        .unwrap();
    let err = conn.take_idle_error().await;
    assert_eq!(err.response_code(), Some(421));
    assert_eq!(conn.state(), ConnectionState::Errored);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let server = MockServer::standard();
    let mut conn = ready(options(&server)).await;

    conn.close().await;
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(server.sessions()[0].lines().last().unwrap(), "QUIT");
    assert_eq!(server.live(), 0);
}

#[tokio::test]
async fn test_operations_require_state() {
    let server = MockServer::standard();
    let mut conn = Connection::new(Arc::new(options(&server).build()));

    let envelope = Envelope::new("sender@example.org", ["ok@valid.recipient"]);
    let err = conn.send(&envelope, BODY).await.unwrap_err();
    assert_eq!(err.code(), "EINVALIDSTATE");
    assert_eq!(conn.state(), ConnectionState::Idle);

    conn.connect().await.unwrap();
    assert!(conn.connect().await.is_err());
    conn.handshake().await.unwrap();
    conn.upgrade().await.unwrap();
    conn.authenticate().await.unwrap();
    conn.noop().await.unwrap();
    conn.reset().await.unwrap();
    assert!(conn.is_ready());
}

#[tokio::test]
async fn test_connection_ids_are_unique() {
    let server = MockServer::standard();
    let a = Connection::new(Arc::new(options(&server).build()));
    let b = Connection::new(Arc::new(options(&server).build()));
    assert_ne!(a.id(), b.id());
}
