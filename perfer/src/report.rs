use core::fmt::{self, Display, Formatter};

use serde::Serialize;

use crate::{cfg::Config, histogram::Histogram, stat::WorkerSnapshot};

/// Aggregated results of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub addr: String,
    pub path: String,
    pub threads: usize,
    pub connections: usize,
    pub keep_alive: bool,
    /// Mean of the workers' elapsed wall time, in seconds.
    pub duration: f64,
    pub sent: u64,
    pub ok: u64,
    pub err: u64,
    /// Requests sent but neither answered nor failed.
    pub unanswered: u64,
    pub sock_created: u64,
    pub sock_errors: u64,
    pub num_2xx: u64,
    pub num_3xx: u64,
    pub num_4xx: u64,
    pub num_5xx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    /// Successful responses per second.
    pub throughput: f64,
    /// Mean latency, in milliseconds.
    pub latency: f64,
    /// Root mean square of latencies, in milliseconds.
    ///
    /// Note that this is not the standard deviation, since the mean is not
    /// subtracted.
    pub dispersion: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    /// Workers that did not exit within the grace period.
    pub stragglers: usize,
}

impl Summary {
    /// Reduces per-worker snapshots into a single summary.
    pub(crate) fn reduce(cfg: &Config, workers: &[WorkerSnapshot]) -> Self {
        let threads = cfg.threads.get();

        let mut sent = 0;
        let mut ok = 0;
        let mut err = 0;
        let mut sock_created = 0;
        let mut sock_errors = 0;
        let mut num_2xx = 0;
        let mut num_3xx = 0;
        let mut num_4xx = 0;
        let mut num_5xx = 0;
        let mut bytes_tx = 0;
        let mut bytes_rx = 0;
        let mut lat_sum = 0.0;
        let mut lat_sq_sum = 0.0;
        let mut elapsed_sum = 0.0;
        let mut hist = Histogram::default();
        let mut stragglers = 0;

        for w in workers {
            sent += w.sent;
            ok += w.ok;
            err += w.err;
            sock_created += w.sock_created;
            sock_errors += w.sock_errors;
            num_2xx += w.num_2xx;
            num_3xx += w.num_3xx;
            num_4xx += w.num_4xx;
            num_5xx += w.num_5xx;
            bytes_tx += w.bytes_tx;
            bytes_rx += w.bytes_rx;
            lat_sum += w.lat_sum;
            lat_sq_sum += w.lat_sq_sum;
            elapsed_sum += w.elapsed.as_secs_f64();
            hist.merge(&w.hist);
            if !w.finished {
                stragglers += 1;
            }
        }

        let duration = elapsed_sum / threads as f64;
        let throughput = if duration > 0.0 { ok as f64 / duration } else { 0.0 };
        let (latency, dispersion) = if ok > 0 {
            (
                lat_sum * 1000.0 / ok as f64,
                (lat_sq_sum / ok as f64).sqrt() * 1000.0,
            )
        } else {
            (0.0, 0.0)
        };
        let ms = |q: f64| hist.quantile(q) as f64 / 1000.0;

        Self {
            addr: cfg.target.to_string(),
            path: cfg.path.clone(),
            threads,
            connections: cfg.connections.get(),
            keep_alive: cfg.keep_alive,
            duration,
            sent,
            ok,
            err,
            unanswered: sent.saturating_sub(ok + err),
            sock_created,
            sock_errors,
            num_2xx,
            num_3xx,
            num_4xx,
            num_5xx,
            bytes_tx,
            bytes_rx,
            throughput,
            latency,
            dispersion,
            p50: ms(0.50),
            p90: ms(0.90),
            p99: ms(0.99),
            stragglers,
        }
    }

    #[inline]
    pub fn non_2xx(&self) -> u64 {
        self.ok - self.num_2xx.min(self.ok)
    }
}

impl Display for Summary {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        if self.err > 0 {
            writeln!(fmt, "{} encountered {} errors.", self.addr, self.err)?;
        }
        if self.unanswered > 0 {
            writeln!(fmt, "{} did not respond to {} requests.", self.addr, self.unanswered)?;
        }
        if self.stragglers > 0 {
            writeln!(fmt, "{} workers did not exit within the grace period.", self.stragglers)?;
        }

        writeln!(fmt, "Benchmarks for:")?;
        writeln!(fmt, "  URL:                {}/{}", self.addr, self.path)?;
        writeln!(fmt, "  Threads:            {}", self.threads)?;
        writeln!(fmt, "  Connections/thread: {}", self.connections)?;
        writeln!(fmt, "  Duration:           {:.1} seconds", self.duration)?;
        writeln!(fmt, "  Keep-Alive:         {}", self.keep_alive)?;
        writeln!(fmt, "Results:")?;
        if self.err > 0 {
            writeln!(fmt, "  Failures:           {}", self.err)?;
        }
        if self.non_2xx() > 0 {
            writeln!(fmt, "  Non-2xx responses:  {}", self.non_2xx())?;
        }
        writeln!(fmt, "  Throughput:         {} requests/second", self.throughput as u64)?;
        writeln!(
            fmt,
            "  Latency:            {:.3} +/-{:.3} msecs (and stdev)",
            self.latency, self.dispersion
        )?;
        write!(
            fmt,
            "  Percentiles:        p50 {:.3}, p90 {:.3}, p99 {:.3} msecs",
            self.p50, self.p90, self.p99
        )
    }
}
