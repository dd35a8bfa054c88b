use core::time::Duration;
use std::{
    sync::Arc,
    thread::{Builder, JoinHandle},
    time::Instant,
};

use crate::{
    cfg::Config,
    context::RunContext,
    error::Error,
    report::Summary,
    stat::WorkerStat,
    worker::Worker,
};

/// How often the orchestrator checks on workers.
const WAIT_INTERVAL: Duration = Duration::from_millis(10);
/// How long workers are given to acknowledge a stop request.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a run that got as far as launching workers.
#[derive(Debug)]
pub struct Outcome {
    pub summary: Summary,
    /// First error that aborted the run, if any.
    pub error: Option<Error>,
}

#[derive(Debug)]
struct WorkerHandle {
    thread: JoinHandle<Result<(), Error>>,
    stat: Arc<WorkerStat>,
}

#[derive(Debug)]
pub struct Runtime {
    cfg: Arc<Config>,
    ctx: Arc<RunContext>,
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        let ctx = Arc::new(RunContext::new(cfg.threads.get()));

        Self { cfg: Arc::new(cfg), ctx }
    }

    /// Returns the shared run context, which can be used to stop the run
    /// from outside.
    #[inline]
    pub fn context(&self) -> Arc<RunContext> {
        self.ctx.clone()
    }

    /// Runs all workers to completion and reduces their statistics.
    ///
    /// Fails only if the workers could not be launched.
    pub async fn run(self) -> Result<Outcome, Error> {
        let num_threads = self.cfg.threads.get();
        let mut workers = Vec::with_capacity(num_threads);

        log::info!(
            "starting {} threads with {} connections each against {}",
            num_threads,
            self.cfg.connections,
            self.cfg.target
        );

        for idx in 0..num_threads {
            let worker = Worker::new(idx, self.cfg.clone(), self.ctx.clone());
            let stat = worker.stat();

            let thread = Builder::new()
                .name(format!("perfer:{idx:02}"))
                .spawn(move || worker.run());
            let thread = match thread {
                Ok(thread) => thread,
                Err(err) => {
                    // Workers already launched would otherwise wait at the
                    // barrier forever.
                    self.stop(&workers).await;
                    return Err(Error::Spawn(err));
                }
            };

            workers.push(WorkerHandle { thread, stat });
        }

        self.wait(&workers).await;

        let snapshots: Vec<_> = workers.iter().map(|w| w.stat.snapshot()).collect();
        let mut error = None;
        for (idx, w) in workers.into_iter().enumerate() {
            if !w.stat.is_finished() {
                log::warn!("worker {idx} did not exit within the grace period, detaching");
                continue;
            }

            match w.thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_fatal() && error.is_none() => error = Some(err),
                // Already logged by the worker.
                Ok(Err(..)) => {}
                Err(..) => log::error!("worker {idx} panicked"),
            }
        }

        let summary = Summary::reduce(&self.cfg, &snapshots);

        Ok(Outcome { summary, error })
    }

    /// Waits for all workers to finish.
    ///
    /// In duration mode workers are stopped once the grace period after the
    /// configured duration expires. In count mode they are stopped once none
    /// of them has made progress for the grace period.
    async fn wait(&self, workers: &[WorkerHandle]) {
        // Last observed progress and when it changed.
        let mut last: Option<(u64, Instant)> = None;

        loop {
            if is_finished(workers) {
                return;
            }
            if !self.ctx.is_running() {
                self.acknowledge(workers).await;
                return;
            }

            let now = Instant::now();
            match (self.ctx.started_at(), self.cfg.duration()) {
                (Some(ts), Some(d)) if now >= ts + d + self.cfg.grace => {
                    log::warn!("grace period expired, stopping workers");
                    self.stop(workers).await;
                    return;
                }
                (Some(..), None) => {
                    let curr = progress(workers);
                    match last {
                        Some((prev, since)) if prev == curr => {
                            if now.duration_since(since) >= self.cfg.grace {
                                log::warn!("no progress within the grace period, stopping workers");
                                self.stop(workers).await;
                                return;
                            }
                        }
                        _ => last = Some((curr, now)),
                    }
                }
                _ => {}
            }

            tokio::time::sleep(WAIT_INTERVAL).await;
        }
    }

    /// Stops all workers and waits for them to acknowledge.
    ///
    /// Idempotent.
    async fn stop(&self, workers: &[WorkerHandle]) {
        self.ctx.stop();
        self.acknowledge(workers).await;
    }

    async fn acknowledge(&self, workers: &[WorkerHandle]) {
        let late = Instant::now() + ACK_TIMEOUT;

        while !is_finished(workers) && Instant::now() < late {
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
    }
}

#[inline]
fn progress(workers: &[WorkerHandle]) -> u64 {
    workers.iter().map(|w| w.stat.progress()).sum()
}

#[inline]
fn is_finished(workers: &[WorkerHandle]) -> bool {
    workers.iter().all(|w| w.stat.is_finished())
}
