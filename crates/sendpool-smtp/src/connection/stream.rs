//! Stream types for SMTP connections.

#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{Error, Result};

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased transport (TCP socket, in-memory pipe, ...).
pub type BoxedStream = Box<dyn AsyncStream>;

/// A transport handed over by a [`SocketProvider`].
pub struct ProvidedSocket {
    /// The established byte stream.
    pub stream: BoxedStream,
    /// True if the stream is already encrypted; implicit TLS is skipped.
    pub secured: bool,
}

impl ProvidedSocket {
    /// Wraps a plaintext stream.
    pub fn plain(stream: impl AsyncStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            secured: false,
        }
    }

    /// Wraps a stream that is already encrypted.
    pub fn secured(stream: impl AsyncStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            secured: true,
        }
    }
}

impl fmt::Debug for ProvidedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedSocket")
            .field("secured", &self.secured)
            .finish_non_exhaustive()
    }
}

/// Supplies the transport instead of opening a TCP socket.
///
/// Invoked before the greeting is read, so the protocol logic is unaware of
/// how the stream was created (proxies, unix sockets, test doubles).
#[async_trait]
pub trait SocketProvider: Send + Sync {
    /// Opens a stream to `host:port`.
    async fn connect(&self, host: &str, port: u16) -> io::Result<ProvidedSocket>;
}

/// A stream that can be either plaintext or TLS.
pub enum SmtpStream {
    /// Plaintext stream.
    Plain(BoxedStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<BoxedStream>>),
}

impl SmtpStream {
    /// Upgrades a plaintext stream to TLS, in place after STARTTLS or right
    /// after connect for implicit TLS.
    pub async fn upgrade_to_tls(self, connector: &TlsConnector, server_name: &str) -> Result<Self> {
        match self {
            Self::Plain(inner) => {
                let server_name = ServerName::try_from(server_name.to_string())?;
                let tls = connector.connect(server_name, inner).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(Error::InvalidState("Stream is already TLS".to_string())),
        }
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl fmt::Debug for SmtpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain(_) => "SmtpStream::Plain",
            Self::Tls(_) => "SmtpStream::Tls",
        })
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Creates a TLS connector, with the `webpki-roots` store unless a client
/// configuration is supplied.
#[must_use]
pub fn tls_connector(config: Option<Arc<rustls::ClientConfig>>) -> TlsConnector {
    let config = config.unwrap_or_else(|| {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config)
}

/// Opens a plaintext TCP stream.
pub async fn connect_tcp(host: &str, port: u16) -> io::Result<ProvidedSocket> {
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;
    Ok(ProvidedSocket::plain(tcp))
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_plain_stream_passes_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = SmtpStream::Plain(Box::new(client));
        assert!(!stream.is_tls());

        stream.write_all(b"EHLO x\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EHLO x\r\n");
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let (client, _server) = tokio::io::duplex(64);
        let stream = SmtpStream::Plain(Box::new(client));
        let result = stream.upgrade_to_tls(&tls_connector(None), "bad name!").await;
        assert!(matches!(result, Err(Error::InvalidDnsName(_))));
    }

    #[test]
    fn test_provided_socket_flags() {
        let (a, b) = tokio::io::duplex(8);
        assert!(!ProvidedSocket::plain(a).secured);
        assert!(ProvidedSocket::secured(b).secured);
    }
}
