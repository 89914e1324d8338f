//! DATA body encoding: CRLF normalization and dot-stuffing.
//!
//! The encoder is incremental so the body can be streamed in bounded chunks;
//! line state carries across chunk boundaries.

use bytes::BytesMut;

/// End-of-data marker written after the body.
pub const DATA_TERMINATOR: &[u8] = b".\r\n";

/// Incremental dot-stuffing encoder.
///
/// Bare `LF` becomes `CRLF`, and a `.` at the start of a line is doubled.
#[derive(Debug, Clone)]
pub struct DotStuffer {
    at_line_start: bool,
    prev_cr: bool,
    bytes_out: usize,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    /// Creates an encoder positioned at the start of a line.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            at_line_start: true,
            prev_cr: false,
            bytes_out: 0,
        }
    }

    /// Encodes one chunk of body bytes into `dst`.
    pub fn encode(&mut self, src: &[u8], dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(src.len() + src.len() / 64 + 2);

        for &byte in src {
            if byte == b'\n' && !self.prev_cr {
                dst.extend_from_slice(b"\r\n");
                self.at_line_start = true;
                self.prev_cr = false;
                continue;
            }
            if self.at_line_start && byte == b'.' {
                dst.extend_from_slice(b".");
            }
            dst.extend_from_slice(&[byte]);
            self.at_line_start = byte == b'\n';
            self.prev_cr = byte == b'\r';
        }

        self.bytes_out += dst.len() - start;
    }

    /// Closes the body: completes a trailing partial line and appends the
    /// end-of-data marker.
    pub fn finish(&mut self, dst: &mut BytesMut) {
        if !self.at_line_start {
            dst.extend_from_slice(b"\r\n");
            self.bytes_out += 2;
            self.at_line_start = true;
            self.prev_cr = false;
        }
        dst.extend_from_slice(DATA_TERMINATOR);
    }

    /// Body bytes produced so far, terminator excluded.
    #[must_use]
    pub const fn bytes_out(&self) -> usize {
        self.bytes_out
    }
}

/// Dot-stuffs a complete body, without the end-of-data marker.
#[must_use]
pub fn dot_stuff(src: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(src.len());
    DotStuffer::new().encode(src, &mut out);
    out.to_vec()
}

/// Reverses [`dot_stuff`] on a CRLF body: a leading `..` becomes `.`.
#[must_use]
pub fn dot_unstuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut at_line_start = true;
    let mut iter = src.iter().copied().peekable();

    while let Some(byte) = iter.next() {
        if at_line_start && byte == b'.' && iter.peek() == Some(&b'.') {
            iter.next();
        }
        out.push(byte);
        at_line_start = byte == b'\n' && out.len() >= 2 && out[out.len() - 2] == b'\r';
    }

    out
}

/// Returns true if any byte has the high bit set.
#[must_use]
pub fn contains_8bit(src: &[u8]) -> bool {
    src.iter().any(|b| !b.is_ascii())
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
    use proptest::prelude::*;

    fn encode_all(chunks: &[&[u8]]) -> Vec<u8> {
        let mut stuffer = DotStuffer::new();
        let mut out = BytesMut::new();
        for chunk in chunks {
            stuffer.encode(chunk, &mut out);
        }
        stuffer.finish(&mut out);
        out.to_vec()
    }

    #[test]
    fn test_leading_dot_doubled() {
        assert_eq!(encode_all(&[b".hidden\r\nok\r\n"]), b"..hidden\r\nok\r\n.\r\n");
        assert_eq!(encode_all(&[b"a\r\n.\r\nb"]), b"a\r\n..\r\nb\r\n.\r\n");
    }

    #[test]
    fn test_inner_dots_untouched() {
        assert_eq!(encode_all(&[b"a.b\r\n"]), b"a.b\r\n.\r\n");
    }

    #[test]
    fn test_bare_lf_normalized() {
        assert_eq!(encode_all(&[b"a\n.b\n"]), b"a\r\n..b\r\n.\r\n");
    }

    #[test]
    fn test_split_across_chunks() {
        assert_eq!(encode_all(&[b"a\r", b"\n.", b"b"]), b"a\r\n..b\r\n.\r\n");
        assert_eq!(encode_all(&[b"a\r\n", b".b\r\n"]), b"a\r\n..b\r\n.\r\n");
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(encode_all(&[]), b".\r\n");
    }

    #[test]
    fn test_bytes_out_excludes_terminator() {
        let mut stuffer = DotStuffer::new();
        let mut out = BytesMut::new();
        stuffer.encode(b".x", &mut out);
        stuffer.finish(&mut out);
        assert_eq!(stuffer.bytes_out(), 5);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_contains_8bit() {
        assert!(!contains_8bit(b"plain ascii\r\n"));
        assert!(contains_8bit("grüße".as_bytes()));
    }

    proptest! {
        #[test]
        fn stuffing_round_trips(lines in prop::collection::vec("[a-z. ]{0,20}", 0..20)) {
            let body = lines.join("\r\n");
            let stuffed = dot_stuff(body.as_bytes());
            prop_assert_eq!(dot_unstuff(&stuffed), body.as_bytes().to_vec());
        }

        #[test]
        fn no_line_is_a_lone_dot(lines in prop::collection::vec("[x.]{0,4}", 1..20)) {
            let body = lines.join("\r\n");
            let stuffed = dot_stuff(body.as_bytes());
            let text = String::from_utf8(stuffed).unwrap();
            prop_assert!(text.split("\r\n").all(|line| line != "."));
        }
    }
}
