//! # sendpool
//!
//! Pooled, rate-limited outbound SMTP/LMTP transport built on
//! [`sendpool_smtp`].
//!
//! ## Features
//!
//! - **Connection pool**: up to `max_connections` live connections, created
//!   on demand and replaced after `max_messages` sends
//! - **Rate limiting**: a pool-wide rolling window shared by every connection
//! - **FIFO dispatch**: queued sends are served oldest first, each exactly
//!   once
//! - **Recovery**: connections lost while idle are discarded and replaced on
//!   demand; a failed in-flight send is reported, never retried
//! - **Events**: `Idle` when a connection frees up, `Error` when an idle one
//!   fails
//!
//! ## Quick Start
//!
//! ```ignore
//! use sendpool::{Mail, SmtpTransport, TransportConfig};
//! use sendpool_smtp::{Credentials, Envelope};
//!
//! #[tokio::main]
//! async fn main() -> sendpool::Result<()> {
//!     let config = TransportConfig::builder()
//!         .service("gmail")
//!         .auth(Credentials::new("me@gmail.com", "app-password"))
//!         .max_connections(3)
//!         .rate_limit(10)
//!         .build()?;
//!     let transport = SmtpTransport::new(config)?;
//!
//!     let envelope = Envelope::new("me@gmail.com", ["friend@example.org"]);
//!     let mail = Mail::from_bytes(envelope, "Subject: Hi\r\n\r\nHello!\r\n");
//!     let info = transport.send(mail).await?;
//!     println!("{}", info.response);
//!
//!     transport.close().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod mail;
pub mod pool;
pub mod rate_limiter;
pub mod services;
pub mod transport;

pub use config::{TransportConfig, TransportConfigBuilder};
pub use error::{Error, Result};
pub use mail::{Mail, MessageSource};
pub use pool::{Pool, PoolEvent, PoolSettings, PoolStatus, SendHandle};
pub use rate_limiter::RateLimiter;
pub use services::Service;
pub use transport::SmtpTransport;
