use core::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use std::{sync::OnceLock, thread, time::Instant};

/// How often workers waiting on the start barrier re-check it.
const BARRIER_INTERVAL: Duration = Duration::from_millis(10);

/// State shared by the orchestrator and every worker for the lifetime of a
/// single run.
#[derive(Debug)]
pub struct RunContext {
    /// Cleared once the run must stop.
    is_running: AtomicBool,
    /// Number of workers that arrived at the start barrier.
    ready: AtomicUsize,
    /// Number of workers expected at the start barrier.
    threads: usize,
    /// Set by the last worker to arrive at the barrier.
    started_at: OnceLock<Instant>,
    /// Global request sequence.
    seq: AtomicU64,
}

impl RunContext {
    pub fn new(threads: usize) -> Self {
        Self {
            is_running: AtomicBool::new(true),
            ready: AtomicUsize::new(0),
            threads,
            started_at: OnceLock::new(),
            seq: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Requests every worker to stop.
    ///
    /// Idempotent.
    #[inline]
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    /// Returns the time at which all workers became ready, if they did.
    #[inline]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Marks the calling worker as ready and blocks until all workers are.
    ///
    /// Must be called exactly once per worker. The last worker to arrive
    /// records the global start time, which is then returned to every
    /// worker. Returns `None` if the run was stopped while waiting.
    pub fn arrive(&self) -> Option<Instant> {
        if self.ready.fetch_add(1, Ordering::AcqRel) + 1 == self.threads {
            let _ = self.started_at.set(Instant::now());
        }

        loop {
            if let Some(ts) = self.started_at() {
                return Some(ts);
            }
            if !self.is_running() {
                return None;
            }

            thread::sleep(BARRIER_INTERVAL);
        }
    }

    /// Returns the next value of the global request sequence.
    ///
    /// Values start at 1 and are never issued twice.
    #[inline]
    pub fn next_sequence(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}
