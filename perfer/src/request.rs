//! Request templates.
//!
//! A template is built once, either generated from the URL path and headers
//! or loaded verbatim, and then shared read-only by every worker.

use core::fmt::Write as _;

use bytes::Bytes;

/// Token replaced by the next value of the global sequence counter.
pub const SEQUENCE_TOKEN: &[u8] = b"${sequence}";

#[derive(Debug, Clone)]
pub struct RequestTemplate {
    data: Bytes,
    /// Whether `data` contains at least one [`SEQUENCE_TOKEN`].
    sequence: bool,
}

impl RequestTemplate {
    /// Generates a `GET` request for the given path.
    ///
    /// The path is expected without its leading slash. Each header line is
    /// appended verbatim in the given order.
    pub fn generate<S: AsRef<str>>(path: &str, host: &str, keep_alive: bool, headers: &[S]) -> Self {
        let connection = if keep_alive { "Keep-Alive" } else { "Close" };

        let mut buf = String::new();
        // Writing into a `String` is infallible.
        let _ = write!(buf, "GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: {connection}\r\n");
        for header in headers {
            buf.push_str(header.as_ref());
            buf.push_str("\r\n");
        }
        buf.push_str("\r\n");

        Self::literal(buf)
    }

    /// Wraps the given bytes as a literal request, sent as-is apart from
    /// sequence substitution.
    pub fn literal<B: Into<Bytes>>(data: B) -> Self {
        let data = data.into();
        let sequence = find(&data, SEQUENCE_TOKEN).is_some();

        Self { data, sequence }
    }

    #[inline]
    pub fn has_sequence(&self) -> bool {
        self.sequence
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Renders this template into `out`, replacing every sequence token with
    /// the decimal representation of `seq`.
    ///
    /// The buffer is cleared first, so it can be reused between requests.
    pub fn render(&self, seq: u64, out: &mut Vec<u8>) {
        out.clear();

        let mut rest = &self.data[..];
        while let Some(idx) = find(rest, SEQUENCE_TOKEN) {
            out.extend_from_slice(&rest[..idx]);
            out.extend_from_slice(seq.to_string().as_bytes());
            rest = &rest[idx + SEQUENCE_TOKEN.len()..];
        }
        out.extend_from_slice(rest);
    }
}

#[inline]
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
