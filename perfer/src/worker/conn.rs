use core::net::SocketAddr;
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use mio::{event::Event, net::TcpStream, Interest, Registry, Token};

use super::response::{ParseError, Response, ResponseParser};
use crate::{cfg::PIPELINE_SIZE, context::RunContext, request::RequestTemplate, stat::WorkerStat};

/// Per-connection failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("connection closed with {0} requests in flight")]
    Closed(usize),
    #[error("response received with no request in flight")]
    Unsolicited,
}

/// What the connection looks like after a receive step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// Still usable.
    Open,
    /// Must be torn down without counting an error.
    Closed,
}

/// Hands out requests to connections.
///
/// Owned by a worker; bounds the number of requests it starts by its share of
/// the total request count, if any.
#[derive(Debug)]
pub struct Issuer {
    request: RequestTemplate,
    ctx: Arc<RunContext>,
    /// Requests started, including partially written ones.
    issued: u64,
    /// Zero means unlimited.
    target: u64,
}

impl Issuer {
    pub fn new(request: RequestTemplate, ctx: Arc<RunContext>, target: u64) -> Self {
        Self { request, ctx, issued: 0, target }
    }

    /// Reserves the next request, returning `false` if the target is reached.
    #[inline]
    fn acquire(&mut self) -> bool {
        if self.target > 0 && self.issued >= self.target {
            return false;
        }

        self.issued += 1;
        true
    }
}

/// A single non-blocking connection and its pipelining state.
#[derive(Debug)]
pub struct Connection {
    token: Token,
    /// Current TCP socket, `None` when disconnected.
    stream: Option<TcpStream>,
    /// Whether the non-blocking connect has completed.
    established: bool,
    /// Cached readiness. Cleared once an operation would block.
    readable: bool,
    writable: bool,
    /// Send timestamps of requests written but not yet answered, oldest
    /// first.
    pending: VecDeque<Instant>,
    /// Whether a request is partially written.
    writing: bool,
    /// Bytes of the current request already written.
    cursor: usize,
    /// Current request when it differs from the template.
    out: Vec<u8>,
    /// Received, not yet parsed bytes.
    buf: BytesMut,
    parser: ResponseParser,
    /// Runtime statistics.
    stat: Arc<WorkerStat>,
}

impl Connection {
    pub fn new(token: Token, stat: Arc<WorkerStat>) -> Self {
        Self {
            token,
            stream: None,
            established: false,
            readable: false,
            writable: false,
            pending: VecDeque::with_capacity(PIPELINE_SIZE),
            writing: false,
            cursor: 0,
            out: Vec::new(),
            buf: BytesMut::with_capacity(4096),
            parser: ResponseParser::default(),
            stat,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Returns the number of requests sent and awaiting a response.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is in flight or partially received, so the
    /// connection can be closed without losing anything.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.parser.is_idle() && self.buf.is_empty()
    }

    /// Returns `true` if another pass can make progress without waiting for
    /// new readiness events.
    #[inline]
    pub fn has_work(&self, backlog: usize, may_send: bool) -> bool {
        self.is_open()
            && self.established
            && (self.readable || (may_send && self.writable && (self.writing || self.pending.len() < backlog)))
    }

    /// Opens a non-blocking socket and initiates connection.
    pub fn connect(&mut self, registry: &Registry, addr: SocketAddr, no_delay: bool) -> io::Result<()> {
        debug_assert!(self.stream.is_none());

        let mut stream = TcpStream::connect(addr)?;
        if no_delay {
            stream.set_nodelay(true)?;
        }
        registry.register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)?;

        self.stream = Some(stream);
        self.established = false;
        self.readable = false;
        self.writable = false;
        self.stat.on_sock_created();

        Ok(())
    }

    /// Updates cached readiness from the given event.
    ///
    /// Fails with [`ConnError::Connect`] if the connection could not be
    /// established, or with [`ConnError::Io`] on error-readiness of an
    /// established one.
    pub fn on_event(&mut self, ev: &Event) -> Result<(), ConnError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };

        if ev.is_readable() {
            self.readable = true;
        }
        if ev.is_writable() {
            self.writable = true;
        }

        if !self.established {
            if let Some(err) = stream.take_error()? {
                return Err(ConnError::Connect(err));
            }
            if ev.is_error() || ev.is_write_closed() {
                return Err(ConnError::Connect(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection failed",
                )));
            }
            if !ev.is_writable() {
                return Ok(());
            }

            match stream.peer_addr() {
                Ok(..) => self.established = true,
                // Spurious wakeup, still connecting.
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(ConnError::Connect(err)),
            }

            return Ok(());
        }

        if ev.is_error() {
            let err = stream
                .take_error()?
                .unwrap_or_else(|| io::Error::other("socket error"));
            return Err(ConnError::Io(err));
        }

        Ok(())
    }

    /// Writes as much of the pending request data as the socket accepts.
    ///
    /// A new request is started only while fewer than `backlog` requests are
    /// in flight and the issuer allows it.
    pub fn send(&mut self, issuer: &mut Issuer, backlog: usize) -> Result<(), ConnError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        while self.established && self.writable {
            if !self.writing {
                if self.pending.len() >= backlog || !issuer.acquire() {
                    break;
                }

                if issuer.request.has_sequence() {
                    issuer.request.render(issuer.ctx.next_sequence(), &mut self.out);
                }
                self.writing = true;
                self.cursor = 0;
            }

            let data = if issuer.request.has_sequence() {
                &self.out[..]
            } else {
                issuer.request.as_bytes()
            };

            match stream.write(&data[self.cursor..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.cursor += n;
                    self.stat.on_send(n as u64);

                    if self.cursor == data.len() {
                        self.writing = false;
                        self.cursor = 0;
                        self.pending.push_back(Instant::now());
                        self.stat.on_request();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Reads all available bytes, matching every complete response to the
    /// oldest request in flight.
    pub fn receive(&mut self, scratch: &mut [u8], keep_alive: bool) -> Result<Recv, ConnError> {
        while self.established && self.readable {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(Recv::Closed);
            };

            let n = match stream.read(scratch) {
                Ok(0) => return self.on_eof(),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            self.stat.on_recv(n as u64);
            self.buf.extend_from_slice(&scratch[..n]);

            while let Some(resp) = self.parser.parse(&mut self.buf)? {
                self.complete(resp)?;

                if resp.close || !keep_alive {
                    // Pipelined requests behind this response are lost.
                    if self.in_flight() > 0 {
                        return Err(ConnError::Closed(self.in_flight()));
                    }
                    return Ok(Recv::Closed);
                }
            }
        }

        Ok(Recv::Open)
    }

    /// Tears the connection down after a failure.
    ///
    /// A partially written request has already taken its slot from the
    /// issuer, so it is counted as sent and failed. The failure is a request
    /// error if any request was lost, otherwise a socket error.
    pub fn abort(&mut self, registry: &Registry) {
        if self.writing {
            self.stat.on_request();
        }
        if self.in_flight() > 0 {
            self.stat.on_error();
        } else {
            self.stat.on_sock_err();
        }

        self.teardown(registry);
    }

    /// Closes the socket and resets the state, abandoning whatever is in
    /// flight.
    pub fn teardown(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = registry.deregister(&mut stream) {
                log::trace!("failed to deregister {:?}: {}", self.token, err);
            }
        }

        self.established = false;
        self.readable = false;
        self.writable = false;
        self.pending.clear();
        self.writing = false;
        self.cursor = 0;
        self.buf.clear();
        self.parser.reset();
    }

    fn on_eof(&mut self) -> Result<Recv, ConnError> {
        if let Some(resp) = self.parser.finish() {
            self.complete(resp)?;
        }

        if !self.is_idle() || self.writing {
            return Err(ConnError::Closed(self.in_flight()));
        }

        Ok(Recv::Closed)
    }

    /// Requests written at least partially and not answered yet.
    #[inline]
    fn in_flight(&self) -> usize {
        self.pending.len() + usize::from(self.writing)
    }

    #[inline]
    fn complete(&mut self, resp: Response) -> Result<(), ConnError> {
        let Some(ts) = self.pending.pop_front() else {
            return Err(ConnError::Unsolicited);
        };

        self.stat.on_response(ts.elapsed(), resp.code);

        Ok(())
    }
}
