//! Incremental HTTP/1.x response framing.
//!
//! Only finds where each response ends; bodies are discarded as they arrive.

use bytes::{Buf, BytesMut};

/// Maximum number of headers accepted in a single response.
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// Whether the server will close the connection after this response.
    pub close: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed response head: {0}")]
    Head(#[from] httparse::Error),
    #[error("malformed chunk size")]
    ChunkSize,
    #[error("invalid Content-Length")]
    ContentLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the status line and headers.
    Head,
    /// Body with a known number of remaining bytes.
    Sized { remaining: u64 },
    /// Waiting for a chunk size line.
    ChunkSize,
    /// Inside chunk data, including its trailing CRLF.
    ChunkData { remaining: u64 },
    /// Waiting for trailer lines after the last chunk.
    Trailer,
    /// Body delimited by connection close.
    UntilClose,
}

#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    /// Head of the response being parsed.
    head: Option<Response>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self { state: State::Head, head: None }
    }
}

impl ResponseParser {
    /// Returns `true` if no response is partially parsed.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    #[inline]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advances parsing over the given buffer, consuming the bytes used.
    ///
    /// Returns the next complete response, if one is delimited by the data
    /// received so far. Call repeatedly to drain pipelined responses.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, ParseError> {
        loop {
            match self.state {
                State::Head => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut resp = httparse::Response::new(&mut headers);
                    let n = match resp.parse(&buf[..])? {
                        httparse::Status::Complete(n) => n,
                        httparse::Status::Partial => return Ok(None),
                    };

                    let code = resp.code.unwrap_or(0);
                    // Interim response, the final one follows for the same
                    // request.
                    if (100..200).contains(&code) && code != 101 {
                        buf.advance(n);
                        continue;
                    }

                    let (state, close) = framing(&resp)?;
                    buf.advance(n);

                    self.head = Some(Response { code, close });
                    self.state = state;
                }
                State::Sized { remaining } => {
                    let n = remaining.min(buf.len() as u64);
                    buf.advance(n as usize);
                    if n < remaining {
                        self.state = State::Sized { remaining: remaining - n };
                        return Ok(None);
                    }

                    return Ok(self.complete());
                }
                State::ChunkSize => match httparse::parse_chunk_size(&buf[..]) {
                    Ok(httparse::Status::Complete((n, 0))) => {
                        buf.advance(n);
                        self.state = State::Trailer;
                    }
                    Ok(httparse::Status::Complete((n, size))) => {
                        buf.advance(n);
                        // Chunk data is followed by CRLF.
                        let remaining = size.checked_add(2).ok_or(ParseError::ChunkSize)?;
                        self.state = State::ChunkData { remaining };
                    }
                    Ok(httparse::Status::Partial) => return Ok(None),
                    Err(httparse::InvalidChunkSize) => return Err(ParseError::ChunkSize),
                },
                State::ChunkData { remaining } => {
                    let n = remaining.min(buf.len() as u64);
                    buf.advance(n as usize);
                    if n < remaining {
                        self.state = State::ChunkData { remaining: remaining - n };
                        return Ok(None);
                    }

                    self.state = State::ChunkSize;
                }
                State::Trailer => {
                    let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(None);
                    };
                    buf.advance(pos + 2);
                    // An empty line terminates the trailer section.
                    if pos == 0 {
                        return Ok(self.complete());
                    }
                }
                State::UntilClose => {
                    buf.clear();
                    return Ok(None);
                }
            }
        }
    }

    /// Handles end of stream.
    ///
    /// Returns the response whose body was delimited by the connection
    /// close, if any.
    pub fn finish(&mut self) -> Option<Response> {
        match self.state {
            State::UntilClose => self.complete(),
            _ => None,
        }
    }

    #[inline]
    fn complete(&mut self) -> Option<Response> {
        self.state = State::Head;
        self.head.take()
    }
}

/// Determines how the body of the given response is delimited.
fn framing(resp: &httparse::Response) -> Result<(State, bool), ParseError> {
    let code = resp.code.unwrap_or(0);
    // HTTP/1.0 closes by default.
    let mut close = resp.version == Some(0);
    let mut chunked = false;
    let mut length = None;

    for h in resp.headers.iter() {
        if h.name.eq_ignore_ascii_case("connection") {
            if has_token(h.value, b"close") {
                close = true;
            } else if has_token(h.value, b"keep-alive") {
                close = false;
            }
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = has_token(h.value, b"chunked");
        } else if h.name.eq_ignore_ascii_case("content-length") {
            let v = core::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ParseError::ContentLength)?;
            length = Some(v);
        }
    }

    let state = match (code, chunked, length) {
        (100..200 | 204 | 304, ..) => State::Sized { remaining: 0 },
        (_, true, _) => State::ChunkSize,
        (_, false, Some(n)) => State::Sized { remaining: n },
        (_, false, None) => {
            close = true;
            State::UntilClose
        }
    };

    Ok((state, close))
}

#[inline]
fn has_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|v| v.trim_ascii().eq_ignore_ascii_case(token))
}
