use core::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use crate::histogram::{Histogram, LogHistogram};

/// Per-worker runtime statistics.
///
/// Only the owning worker writes; the orchestrator reads after the worker
/// has finished, or at any time for a straggling worker, in which case the
/// values are only approximately consistent with each other.
#[derive(Debug, Default)]
pub struct WorkerStat {
    /// Requests fully written to a socket.
    num_requests: AtomicU64,
    /// Complete responses matched to a request.
    num_responses: AtomicU64,
    /// Requests lost to a connection failure.
    num_errors: AtomicU64,
    /// The number of sockets created and connecting.
    num_sock_created: AtomicU64,
    /// Connection failures that did not affect an in-flight request.
    num_sock_errors: AtomicU64,
    num_2xx: AtomicU64,
    num_3xx: AtomicU64,
    num_4xx: AtomicU64,
    num_5xx: AtomicU64,
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    /// Sum of latencies, in seconds.
    lat_sum: AtomicF64,
    /// Sum of squared latencies, in seconds squared.
    lat_sq_sum: AtomicF64,
    hist: LogHistogram,
    /// Time between the global start and the moment this worker's loop
    /// ended, in nanoseconds.
    elapsed: AtomicU64,
    finished: AtomicBool,
}

impl WorkerStat {
    /// Should be called after each request fully transmitted.
    #[inline]
    pub fn on_request(&self) {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_response(&self, latency: Duration, code: u16) {
        let secs = latency.as_secs_f64();

        self.lat_sum.add(secs);
        self.lat_sq_sum.add(secs * secs);
        self.hist.record(latency.as_micros() as u64);

        match code {
            200..300 => self.num_2xx.fetch_add(1, Ordering::Relaxed),
            300..400 => self.num_3xx.fetch_add(1, Ordering::Relaxed),
            400..500 => self.num_4xx.fetch_add(1, Ordering::Relaxed),
            500..600 => self.num_5xx.fetch_add(1, Ordering::Relaxed),
            c => {
                log::debug!("unexpected code: {}", c);
                0
            }
        };
        // Published last, so that readers never see more responses than
        // latency samples.
        self.num_responses.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn on_error(&self) {
        self.num_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_sock_created(&self) {
        self.num_sock_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_sock_err(&self) {
        self.num_sock_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_send(&self, n: u64) {
        self.bytes_tx.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_recv(&self, n: u64) {
        self.bytes_rx.fetch_add(n, Ordering::Relaxed);
    }

    /// Marks the worker as finished.
    ///
    /// Must be the last call made by the worker.
    #[inline]
    pub fn on_finish(&self, elapsed: Duration) {
        self.elapsed.store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.finished.store(true, Ordering::Release);
    }

    #[inline]
    pub fn num_requests(&self) -> u64 {
        self.num_requests.load(Ordering::Relaxed)
    }

    /// Returns a value that grows whenever the worker moves any data or
    /// loses a request.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
            + self.bytes_rx.load(Ordering::Relaxed)
            + self.num_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let finished = self.is_finished();
        let ok = self.num_responses.load(Ordering::Acquire);

        WorkerSnapshot {
            sent: self.num_requests.load(Ordering::Relaxed),
            ok,
            err: self.num_errors.load(Ordering::Relaxed),
            sock_created: self.num_sock_created.load(Ordering::Relaxed),
            sock_errors: self.num_sock_errors.load(Ordering::Relaxed),
            num_2xx: self.num_2xx.load(Ordering::Relaxed),
            num_3xx: self.num_3xx.load(Ordering::Relaxed),
            num_4xx: self.num_4xx.load(Ordering::Relaxed),
            num_5xx: self.num_5xx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            lat_sum: self.lat_sum.get(),
            lat_sq_sum: self.lat_sq_sum.get(),
            hist: self.hist.snapshot(),
            elapsed: Duration::from_nanos(self.elapsed.load(Ordering::Relaxed)),
            finished,
        }
    }
}

/// Plain copy of a [`WorkerStat`].
#[derive(Debug, Clone, Default)]
pub struct WorkerSnapshot {
    pub sent: u64,
    pub ok: u64,
    pub err: u64,
    pub sock_created: u64,
    pub sock_errors: u64,
    pub num_2xx: u64,
    pub num_3xx: u64,
    pub num_4xx: u64,
    pub num_5xx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub lat_sum: f64,
    pub lat_sq_sum: f64,
    pub hist: Histogram,
    pub elapsed: Duration,
    pub finished: bool,
}

/// `f64` stored as bits in an [`AtomicU64`].
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    #[inline]
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    fn add(&self, v: f64) {
        // Single writer, no need for a CAS loop.
        let curr = self.get();
        self.0.store((curr + v).to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_accumulates_latency() {
        let stat = WorkerStat::default();
        stat.on_request();
        stat.on_request();
        stat.on_response(Duration::from_millis(10), 200);
        stat.on_response(Duration::from_millis(30), 503);

        let s = stat.snapshot();
        assert_eq!(2, s.sent);
        assert_eq!(2, s.ok);
        assert_eq!(1, s.num_2xx);
        assert_eq!(1, s.num_5xx);
        assert!((s.lat_sum - 0.040).abs() < 1e-9);
        assert!((s.lat_sq_sum - (0.0001 + 0.0009)).abs() < 1e-9);
        assert_eq!(2, s.hist.count());
        assert!(!s.finished);
    }

    #[test]
    fn finish_publishes_elapsed() {
        let stat = WorkerStat::default();
        stat.on_finish(Duration::from_millis(1500));

        let s = stat.snapshot();
        assert!(s.finished);
        assert_eq!(Duration::from_millis(1500), s.elapsed);
    }

    #[test]
    fn progress_tracks_bytes_and_errors() {
        let stat = WorkerStat::default();
        assert_eq!(0, stat.progress());

        stat.on_send(100);
        stat.on_recv(20);
        assert_eq!(120, stat.progress());

        stat.on_error();
        assert_eq!(121, stat.progress());

        // Reconnecting alone is no progress.
        stat.on_sock_created();
        stat.on_sock_err();
        assert_eq!(121, stat.progress());
    }

    #[test]
    fn unexpected_code_still_counts_as_response() {
        let stat = WorkerStat::default();
        stat.on_response(Duration::from_millis(1), 999);

        let s = stat.snapshot();
        assert_eq!(1, s.ok);
        assert_eq!(0, s.num_2xx + s.num_3xx + s.num_4xx + s.num_5xx);
    }
}
