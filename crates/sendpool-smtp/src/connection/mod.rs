//! SMTP connection management.
//!
//! - [`stream`]: plain/TLS transport and the [`SocketProvider`] hook
//! - `framed`: reply framing under the inactivity timer
//! - [`options`]: per-connection settings
//! - `client`: the [`Connection`] state machine

mod client;
mod framed;
pub mod options;
pub mod stream;

#[cfg(test)]
mod tests;

pub use client::{Connection, ConnectionState};
pub use framed::FramedStream;
pub use options::{ConnectionOptions, ConnectionOptionsBuilder};
pub use stream::{
    AsyncStream, BoxedStream, ProvidedSocket, SmtpStream, SocketProvider, connect_tcp,
    tls_connector,
};
