//! # sendpool-smtp
//!
//! Async SMTP/LMTP client connection engine (RFC 5321, RFC 2033).
//!
//! ## Features
//!
//! - **Explicit state machine**: one [`Connection`] per transport, with
//!   states from `Idle` through `Ready`/`Sending` to `Closed` or `Errored`
//! - **Pipelining**: MAIL FROM and RCPT TO batched in one write, replies
//!   matched strictly in order
//! - **TLS**: implicit TLS and STARTTLS via rustls, with `require_tls`,
//!   `ignore_tls` and opportunistic modes
//! - **Authentication**: PLAIN, LOGIN, CRAM-MD5, XOAUTH2 and caller-supplied
//!   mechanisms ([`CustomAuth`])
//! - **Extensions**: 8BITMIME, SIZE, SMTPUTF8, DSN, LMTP
//! - **Streaming**: the DATA body is read in bounded chunks, dot-stuffed and
//!   CRLF-normalized on the fly
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sendpool_smtp::{Connection, ConnectionOptions, Credentials, Envelope};
//!
//! #[tokio::main]
//! async fn main() -> sendpool_smtp::Result<()> {
//!     let options = ConnectionOptions::builder("smtp.example.com")
//!         .credentials(Credentials::new("user@example.com", "password"))
//!         .require_tls(true)
//!         .build();
//!
//!     let mut conn = Connection::new(Arc::new(options));
//!     conn.establish().await?;
//!
//!     let envelope = Envelope::new("user@example.com", ["friend@example.org"]);
//!     let message = &b"Subject: Hi\r\n\r\nHello!\r\n"[..];
//!     let info = conn.send(&envelope, message).await?;
//!     println!("accepted: {:?}", info.accepted);
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: credentials, mechanism selection and SASL exchanges
//! - [`codec`]: dot-stuffing
//! - [`command`]: SMTP command builders
//! - [`connection`]: transport, options and the connection state machine
//! - [`parser`]: reply parser
//! - [`types`]: addresses, envelopes, capabilities, replies and results

#![forbid(unsafe_code)]

pub mod auth;
pub mod codec;
pub mod command;
pub mod connection;
mod error;
pub mod parser;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use auth::{AuthContext, AuthStrategy, CustomAuth, Credentials};
pub use connection::{
    Connection, ConnectionOptions, ConnectionOptionsBuilder, ConnectionState, ProvidedSocket,
    SocketProvider,
};
pub use error::{Error, ErrorKind, Result, TimeoutPhase};
pub use types::{
    Address, AuthMechanism, Capabilities, Dsn, DsnNotify, DsnReturn, Envelope, Extension,
    RecipientError, Reply, ReplyCode, SendInfo,
};
