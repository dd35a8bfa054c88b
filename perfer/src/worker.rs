//! Per-thread event loop.
//!
//! Each worker owns a fixed set of connections and drives them through
//! connect/send/receive cycles using readiness polling, until the run's stop
//! condition is reached and in-flight requests are drained.

use core::{net::SocketAddr, time::Duration};
use std::{io, sync::Arc, time::Instant};

use mio::{Events, Poll, Token};

use self::conn::{ConnError, Connection, Issuer, Recv};
use crate::{cfg::Config, context::RunContext, error::Error, stat::WorkerStat};

mod conn;
mod response;

/// Upper bound on how long a worker waits for readiness before re-checking
/// the stop condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Size of the per-worker receive buffer.
const SCRATCH_SIZE: usize = 16 * 1024;

/// Stop condition of a single worker.
#[derive(Debug, Clone, Copy)]
enum Bound {
    /// Stop sending at the given instant.
    Until(Instant),
    /// Stop sending once this many requests are written.
    Requests(u64),
}

#[derive(Debug)]
pub struct Worker {
    id: usize,
    cfg: Arc<Config>,
    ctx: Arc<RunContext>,
    conns: Vec<Connection>,
    /// Readiness events, sized once for all connections.
    events: Events,
    scratch: Box<[u8]>,
    issuer: Issuer,
    /// Number of requests this worker sends, zero in duration mode.
    target: u64,
    /// Runtime statistics.
    stat: Arc<WorkerStat>,
}

impl Worker {
    pub fn new(id: usize, cfg: Arc<Config>, ctx: Arc<RunContext>) -> Self {
        let stat = Arc::new(WorkerStat::default());
        let num_conns = cfg.connections.get();
        let target = cfg.requests_per_worker();

        let conns = (0..num_conns)
            .map(|idx| Connection::new(Token(idx), stat.clone()))
            .collect();
        let issuer = Issuer::new(cfg.request.clone(), ctx.clone(), target);

        Self {
            id,
            cfg,
            ctx,
            conns,
            events: Events::with_capacity(num_conns),
            scratch: vec![0; SCRATCH_SIZE].into_boxed_slice(),
            issuer,
            target,
            stat,
        }
    }

    #[inline]
    pub fn stat(&self) -> Arc<WorkerStat> {
        self.stat.clone()
    }

    /// Runs this worker until the run ends.
    ///
    /// The finished flag is set on every path, including failures.
    pub fn run(mut self) -> Result<(), Error> {
        log::debug!("worker {} started", self.id);

        let rc = match Poll::new() {
            Ok(poll) => self.execute(poll),
            Err(err) => {
                // Without arriving at the barrier every other worker would
                // wait forever.
                self.ctx.stop();
                Err(Error::Poll(err))
            }
        };

        let elapsed = match self.ctx.started_at() {
            Some(ts) => ts.elapsed(),
            None => Duration::ZERO,
        };
        match &rc {
            Ok(()) => log::debug!("worker {} finished in {:?}", self.id, elapsed),
            Err(err) => log::error!("worker {}: {}", self.id, err),
        }
        self.stat.on_finish(elapsed);

        rc
    }

    fn execute(&mut self, mut poll: Poll) -> Result<(), Error> {
        let addr = match self.cfg.target.resolve() {
            Ok(addr) => addr,
            Err(err) => {
                self.ctx.stop();
                return Err(err);
            }
        };
        log::debug!("worker {}: resolved {} to {}", self.id, self.cfg.target, addr);

        let Some(start) = self.ctx.arrive() else {
            return Ok(());
        };
        let bound = match self.cfg.duration() {
            Some(d) => Bound::Until(start + d),
            None => Bound::Requests(self.target),
        };

        let rc = self.event_loop(&mut poll, addr, bound);

        for conn in &mut self.conns {
            conn.teardown(poll.registry());
        }

        rc
    }

    fn event_loop(&mut self, poll: &mut Poll, addr: SocketAddr, bound: Bound) -> Result<(), Error> {
        let backlog = self.cfg.backlog;
        let mut done_at = None;
        let mut timeout = POLL_INTERVAL;

        while self.ctx.is_running() {
            let now = Instant::now();
            let done = match bound {
                Bound::Until(end) => now >= end,
                Bound::Requests(n) => self.stat.num_requests() >= n,
            };

            if done {
                let done_at = *done_at.get_or_insert(now);
                if now.duration_since(done_at) >= self.cfg.grace {
                    let pending: usize = self.conns.iter().map(Connection::pending).sum();
                    log::warn!(
                        "worker {}: abandoning {} requests in flight after grace period",
                        self.id,
                        pending
                    );
                    break;
                }
            }

            for conn in &mut self.conns {
                if conn.is_open() {
                    // Nothing more to send, nothing to wait for.
                    if done && conn.is_idle() {
                        conn.teardown(poll.registry());
                    }
                } else if !done {
                    if let Err(err) = conn.connect(poll.registry(), addr, self.cfg.tcp_no_delay) {
                        self.ctx.stop();
                        return Err(Error::Connect { addr, err });
                    }
                }
            }

            if !self.conns.iter().any(Connection::is_open) {
                break;
            }

            match poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Poll(err)),
            }

            for ev in self.events.iter() {
                let Some(conn) = self.conns.get_mut(ev.token().0) else {
                    continue;
                };

                match conn.on_event(ev) {
                    Ok(()) => {}
                    Err(ConnError::Connect(err)) => {
                        self.ctx.stop();
                        return Err(Error::Connect { addr, err });
                    }
                    Err(err) => on_conn_error(conn, poll, err),
                }
            }

            let mut busy = false;
            for conn in &mut self.conns {
                match conn.receive(&mut self.scratch, self.cfg.keep_alive) {
                    Ok(Recv::Open) => {}
                    Ok(Recv::Closed) => {
                        conn.teardown(poll.registry());
                        continue;
                    }
                    Err(err) => {
                        on_conn_error(conn, poll, err);
                        continue;
                    }
                }

                if !done {
                    if let Err(err) = conn.send(&mut self.issuer, backlog) {
                        on_conn_error(conn, poll, err);
                        continue;
                    }
                }

                busy |= conn.has_work(backlog, !done);
            }

            // Cached readiness left to consume, don't sleep.
            timeout = if busy { Duration::ZERO } else { POLL_INTERVAL };
        }

        Ok(())
    }
}

#[inline]
fn on_conn_error(conn: &mut Connection, poll: &Poll, err: ConnError) {
    log::debug!("connection failed: {}", err);
    conn.abort(poll.registry());
}
