//! Transport facade tests against the in-memory SMTP server.

#![allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]

use std::sync::Arc;
use std::time::Duration;

use sendpool::{Error, Mail, SmtpTransport, TransportConfig, TransportConfigBuilder};
use sendpool_smtp::testing::{MockConfig, MockServer};
use sendpool_smtp::{Credentials, Envelope};
use tokio::sync::oneshot;

const BODY: &str = "From: a@valid.sender\r\nSubject: hello\r\n\r\nHi there\r\n";

fn builder(server: &Arc<MockServer>) -> TransportConfigBuilder {
    TransportConfig::builder()
        .host("mock.example.net")
        .name("client.example.org")
        .socket_provider(server.provider())
}

fn transport(config: TransportConfigBuilder) -> SmtpTransport {
    SmtpTransport::new(config.build().unwrap()).unwrap()
}

#[tokio::test]
async fn mixed_recipients_report_partial_success() {
    let server = MockServer::standard();
    let transport = transport(builder(&server));

    let envelope = Envelope::new(
        "a@valid.sender",
        ["ok@valid.recipient", "bad@invalid.recipient"],
    );
    let info = transport
        .send(Mail::from_bytes(envelope, BODY).with_message_id("<m1@valid.sender>"))
        .await
        .unwrap();

    assert_eq!(info.accepted, vec!["ok@valid.recipient".to_string()]);
    assert_eq!(info.rejected, vec!["bad@invalid.recipient".to_string()]);
    assert_eq!(info.rejected_errors.len(), 1);
    assert_eq!(info.message_id.as_deref(), Some("<m1@valid.sender>"));
    assert!(info.message_size >= BODY.len());
    transport.close().await;
}

#[tokio::test]
async fn zero_valid_recipients_fail_with_every_rejection() {
    let server = MockServer::standard();
    let transport = transport(builder(&server));

    let envelope = Envelope::new(
        "a@valid.sender",
        ["x@invalid.recipient", "not-an-address", "y@invalid.recipient"],
    );
    let err = transport
        .send(Mail::from_bytes(envelope, BODY))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EENVELOPE");
    assert_eq!(err.as_smtp().unwrap().rejected().len(), 3);
    transport.close().await;
}

#[tokio::test]
async fn helo_fallback_still_authenticates_when_forced() {
    let server = MockServer::new(MockConfig {
        ehlo: false,
        require_auth: true,
        ..MockConfig::default()
    });
    let transport = transport(
        builder(&server)
            .auth(Credentials::new("user", "pass"))
            .auth_method("LOGIN"),
    );

    let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
    transport
        .send(Mail::from_bytes(envelope, BODY))
        .await
        .unwrap();

    let session = &server.sessions()[0];
    assert_eq!(session.authenticated_as.as_deref(), Some("user"));
    assert!(session.commands.iter().all(|c| !c.batched));
    transport.close().await;
}

#[tokio::test]
async fn direct_mode_uses_one_connection_per_send() {
    let server = MockServer::standard();
    let transport = transport(builder(&server).pool(false));
    assert!(!transport.is_pooled());
    assert!(transport.status().is_none());

    for n in 0..3 {
        let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
        let info = transport
            .send(Mail::from_bytes(envelope, BODY).with_message_id(format!("<{n}@x>")))
            .await
            .unwrap();
        assert_eq!(info.message_id, Some(format!("<{n}@x>")));
    }

    assert_eq!(server.connections(), 3);
    assert_eq!(server.live(), 0);
    assert!(
        server
            .sessions()
            .iter()
            .all(|s| s.lines().last().map(String::as_str) == Some("QUIT"))
    );

    transport.close().await;
    assert!(!transport.is_idle());
    let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
    assert!(matches!(
        transport.send(Mail::from_bytes(envelope, BODY)).await,
        Err(Error::PoolClosed)
    ));
}

#[tokio::test]
async fn pooled_mode_reuses_connections() {
    let server = MockServer::standard();
    let transport = transport(builder(&server).max_connections(1));
    assert!(transport.is_pooled());
    assert!(transport.is_idle());

    for _ in 0..4 {
        let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
        transport
            .send(Mail::from_bytes(envelope, BODY))
            .await
            .unwrap();
    }
    assert_eq!(server.connections(), 1);
    assert_eq!(server.deliveries().len(), 4);

    transport.close().await;
    transport.close().await;
    assert!(transport.status().unwrap().closed);
    assert_eq!(server.live(), 0);
}

#[tokio::test]
async fn send_with_invokes_callback_once() {
    let server = MockServer::standard();
    let transport = transport(builder(&server));
    let (tx, rx) = oneshot::channel();

    let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
    transport.send_with(Mail::from_bytes(envelope, BODY), move |result| {
        let _ = tx.send(result);
    });

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap().accepted.len(), 1);
    transport.close().await;
}

#[tokio::test]
async fn verify_checks_configuration() {
    let server = MockServer::standard();

    let good = transport(builder(&server).auth(Credentials::new("user", "pass")));
    good.verify().await.unwrap();

    let bad = transport(builder(&server).auth(Credentials::new("user", "nope")));
    let err = bad.verify().await.unwrap_err();
    assert_eq!(err.code(), "EAUTH");
    assert_eq!(err.response_code(), Some(535));

    assert_eq!(server.live(), 0);
    assert!(server.deliveries().is_empty());
    good.close().await;
    bad.close().await;
}

#[tokio::test]
async fn lmtp_transport() {
    let server = MockServer::new(MockConfig {
        lmtp: true,
        extensions: vec!["PIPELINING".to_string()],
        ..MockConfig::default()
    });
    let transport = transport(builder(&server).lmtp(true));

    let envelope = Envelope::new(
        "a@valid.sender",
        ["one@valid.recipient", "two@valid.recipient"],
    );
    let info = transport
        .send(Mail::from_bytes(envelope, BODY))
        .await
        .unwrap();
    assert_eq!(info.accepted.len(), 2);
    assert!(info.response.contains("delivered"));
    transport.close().await;
}

#[tokio::test]
async fn service_endpoint_with_socket_override() {
    let server = MockServer::standard();
    let config = TransportConfig::builder()
        .service("Gmail")
        .secure(false)
        .socket_provider(server.provider())
        .build()
        .unwrap();
    assert_eq!(config.connection.host, "smtp.gmail.com");
    assert_eq!(config.connection.port, 465);

    let transport = SmtpTransport::new(config).unwrap();
    let envelope = Envelope::new("a@valid.sender", ["ok@valid.recipient"]);
    transport
        .send(Mail::from_bytes(envelope, BODY))
        .await
        .unwrap();
    transport.close().await;
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = TransportConfig::new("mx.example.com");
    config.max_connections = 0;
    assert!(matches!(SmtpTransport::new(config), Err(Error::Config(_))));
}
