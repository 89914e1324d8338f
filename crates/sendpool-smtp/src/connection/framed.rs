//! Framed I/O for SMTP protocol.
//!
//! SMTP uses CRLF-terminated lines; a reply is one or more lines sharing a
//! code, the last one separated by a space. Every read and write runs under
//! the socket inactivity timer, which restarts whenever bytes arrive.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

use super::SmtpStream;
use crate::command::Command;
use crate::error::{Error, Result, TimeoutPhase};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::Reply;

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum number of lines in one reply.
const MAX_REPLY_LINES: usize = 1024;

/// Framed connection for SMTP protocol.
#[derive(Debug)]
pub struct FramedStream {
    reader: BufReader<SmtpStream>,
    write_buffer: BytesMut,
    socket_timeout: Duration,
    cid: u64,
}

impl FramedStream {
    /// Creates a new framed stream.
    pub fn new(stream: SmtpStream, socket_timeout: Duration, cid: u64) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            socket_timeout,
            cid,
        }
    }

    /// Reads one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?;
            trace!(cid = self.cid, "S: {line}");
            let last = is_last_reply_line(&line);
            lines.push(line);

            if last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol("reply has too many lines".to_string()));
            }
        }

        parse_reply(&lines)
    }

    /// Reads a single line, without its terminator.
    async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();

        loop {
            let buf = timed(self.socket_timeout, self.reader.fill_buf()).await??;
            if buf.is_empty() {
                return Err(Error::ConnectionClosed);
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..pos]);
                self.reader.consume(pos + 1);
                break;
            }

            let len = buf.len();
            line.extend_from_slice(buf);
            self.reader.consume(len);

            if line.len() > MAX_LINE_LENGTH {
                return Err(Error::Protocol("line too long".to_string()));
            }
        }

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Writes one command and flushes.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        trace!(cid = self.cid, "C: {}", command.redacted());
        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(&command.serialize());
        self.flush_buffer().await
    }

    /// Appends a command to the write buffer without sending it.
    pub fn queue_command(&mut self, command: &Command) {
        trace!(cid = self.cid, "C: {}", command.redacted());
        self.write_buffer.extend_from_slice(&command.serialize());
    }

    /// Sends every queued command in one write.
    pub async fn flush_queued(&mut self) -> Result<()> {
        self.flush_buffer().await
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        let data = self.write_buffer.split();
        self.write_all(&data).await
    }

    /// Writes raw bytes (DATA body) and flushes.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        timed(self.socket_timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await??;
        Ok(())
    }

    /// Waits until the peer sends something or closes.
    ///
    /// Returns `true` if bytes are buffered, `false` on EOF. Nothing is
    /// consumed, so the call can be abandoned in a `select!`.
    pub async fn peer_activity(&mut self) -> std::io::Result<bool> {
        let buf = self.reader.fill_buf().await?;
        Ok(!buf.is_empty())
    }

    /// Returns true if unread bytes are buffered.
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Shuts the write side down, ignoring errors.
    pub async fn shutdown(&mut self) {
        let stream = self.reader.get_mut();
        let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Fails if the peer already sent bytes that would be lost, which after
    /// STARTTLS means plaintext was injected ahead of the handshake.
    pub fn into_inner(self) -> Result<SmtpStream> {
        if self.has_buffered() {
            return Err(Error::Protocol(
                "unexpected data received before TLS handshake".to_string(),
            ));
        }
        Ok(self.reader.into_inner())
    }
}

async fn timed<F: Future>(after: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(after, fut).await.map_err(|_| Error::Timeout {
        phase: TimeoutPhase::Socket,
        after,
    })
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
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn framed(timeout: Duration) -> (FramedStream, DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (
            FramedStream::new(SmtpStream::Plain(Box::new(client)), timeout, 1),
            server,
        )
    }

    #[tokio::test]
    async fn test_read_multi_line_reply() {
        let (mut framed, mut server) = framed(Duration::from_secs(5));
        server
            .write_all(b"250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 100\r\n")
            .await
            .unwrap();

        let reply = framed.read_reply().await.unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["mx.example.com", "PIPELINING", "SIZE 100"]);
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        use tokio_test::io::Builder;

        let mock = Builder::new()
            .read(b"250-mx.example.com gre")
            .read(b"ets you\r\n250-8BITMIME\r")
            .read(b"\n250 OK\r\n")
            .build();
        let mut framed = FramedStream::new(SmtpStream::Plain(Box::new(mock)), Duration::from_secs(5), 1);

        let reply = framed.read_reply().await.unwrap();
        assert_eq!(
            reply.message,
            vec!["mx.example.com greets you", "8BITMIME", "OK"]
        );
    }

    #[tokio::test]
    async fn test_send_command_writes_crlf_line() {
        use tokio_test::io::Builder;

        let mock = Builder::new()
            .write(b"MAIL FROM:<a@example.org>\r\n")
            .read(b"250 2.1.0 Ok\r\n")
            .build();
        let mut framed = FramedStream::new(SmtpStream::Plain(Box::new(mock)), Duration::from_secs(5), 1);

        framed
            .send_command(&Command::MailFrom {
                from: "a@example.org".to_string(),
                params: crate::command::MailParams::default(),
            })
            .await
            .unwrap();
        assert!(framed.read_reply().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_replies_read_in_order() {
        let (mut framed, mut server) = framed(Duration::from_secs(5));
        server
            .write_all(b"250 first\r\n550 second\n")
            .await
            .unwrap();

        assert_eq!(framed.read_reply().await.unwrap().first_line(), "first");
        let second = framed.read_reply().await.unwrap();
        assert_eq!(second.code.as_u16(), 550);
        assert_eq!(second.first_line(), "second");
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (mut framed, server) = framed(Duration::from_secs(5));
        drop(server);
        assert!(matches!(
            framed.read_reply().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout() {
        let (mut framed, _server) = framed(Duration::from_secs(3));
        let err = framed.read_reply().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                phase: TimeoutPhase::Socket,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pipelined_commands_in_one_write() {
        let (mut framed, mut server) = framed(Duration::from_secs(5));
        framed.queue_command(&Command::Noop);
        framed.queue_command(&Command::Rset);
        framed.flush_queued().await.unwrap();

        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NOOP\r\nRSET\r\n");
    }

    #[tokio::test]
    async fn test_peer_activity_does_not_consume() {
        let (mut framed, mut server) = framed(Duration::from_secs(5));
        server.write_all(b"421 bye\r\n").await.unwrap();

        assert!(framed.peer_activity().await.unwrap());
        assert!(framed.has_buffered());
        assert_eq!(framed.read_reply().await.unwrap().code.as_u16(), 421);

        drop(server);
        assert!(!framed.peer_activity().await.unwrap());
    }

    #[tokio::test]
    async fn test_into_inner_rejects_buffered_data() {
        let (mut framed, mut server) = framed(Duration::from_secs(5));
        server.write_all(b"220 go\r\n250 injected\r\n").await.unwrap();
        framed.read_reply().await.unwrap();
        assert!(framed.into_inner().is_err());
    }
}
