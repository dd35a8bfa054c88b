use core::sync::atomic::{AtomicU64, Ordering};

/// Largest tracked value, in microseconds.
const MAX_US: f64 = 60_000_000.0;
/// Ratio between neighbouring bucket bounds.
const FACTOR: f64 = 1.5;

/// Logarithmic latency histogram with microsecond resolution.
///
/// Written by a single worker and read by the orchestrator, possibly while
/// the worker is still running.
#[derive(Debug)]
pub struct LogHistogram {
    buckets: Vec<AtomicU64>,
}

impl Default for LogHistogram {
    fn default() -> Self {
        let buckets = (0..num_buckets()).map(|_| AtomicU64::new(0)).collect();

        Self { buckets }
    }
}

impl LogHistogram {
    #[inline]
    pub fn record(&self, us: u64) {
        self.buckets[bucket(us, self.buckets.len())].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn snapshot(&self) -> Histogram {
        Histogram {
            buckets: self.buckets.iter().map(|v| v.load(Ordering::Relaxed)).collect(),
        }
    }
}

/// Point-in-time, mergeable copy of a [`LogHistogram`].
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    buckets: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self { buckets: vec![0; num_buckets()] }
    }
}

impl Histogram {
    #[cfg(test)]
    fn from_buckets(buckets: Vec<u64>) -> Self {
        Self { buckets }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn merge(&mut self, other: &Histogram) {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }

        for (idx, b) in other.buckets.iter().enumerate() {
            self.buckets[idx] += b;
        }
    }

    /// Estimates the given quantile, in microseconds.
    ///
    /// Finds the first bucket where the cumulative count reaches `q` of the
    /// total, then interpolates linearly between that bucket's bounds in
    /// log coordinates, so the result is `FACTOR^x` for a fractional index
    /// `x`.
    pub fn quantile(&self, q: f64) -> u64 {
        assert!((0.0..=1.0).contains(&q));

        let size = self.count();
        if size == 0 {
            return 0;
        }

        let mut sum = 0;
        for (idx, &b) in self.buckets.iter().enumerate() {
            if ((sum + b) as f64) >= q * (size as f64) {
                if b == 0 {
                    return 0;
                }

                let x = (q * size as f64 - sum as f64) / b as f64 + idx as f64;
                return FACTOR.powf(x) as u64;
            }
            sum += b;
        }

        u64::MAX
    }
}

fn num_buckets() -> usize {
    let mut n = 0;
    let mut curr = 1.0;
    while curr < MAX_US {
        n += 1;
        curr *= FACTOR;
    }

    n
}

#[inline]
fn bucket(us: u64, len: usize) -> usize {
    let idx = (us.max(1) as f64).log(FACTOR) as usize;
    idx.min(len - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_quantile() {
        let h = LogHistogram::default();
        h.record(1000);
        assert_eq!(0, h.snapshot().quantile(0.0));
    }

    #[test]
    fn empty_quantile() {
        assert_eq!(0, Histogram::default().quantile(0.99));
    }

    #[test]
    fn low_bound_quantile() {
        let cases: &[[u64; 45]] = &[
            [
                213, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 151, 0, 0, 0, 0, 0, 36, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            [
                182, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 12, 0, 0, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
        ];
        for c in cases {
            let h = Histogram::from_buckets(c.to_vec());
            assert_eq!(h.quantile(0.10), 1);
            assert_eq!(h.quantile(0.50), 1);
        }
    }

    #[test]
    fn quantile_within_bucket_bounds() {
        let h = LogHistogram::default();
        for _ in 0..100 {
            h.record(10_000);
        }

        let p = h.snapshot().quantile(0.5);
        let idx = bucket(10_000, num_buckets()) as i32;
        assert!(p as f64 >= FACTOR.powi(idx) - 1.0);
        assert!(p as f64 <= FACTOR.powi(idx + 1));
    }

    #[test]
    fn merge_sums_buckets() {
        let a = LogHistogram::default();
        let b = LogHistogram::default();
        a.record(5);
        b.record(5);
        b.record(1_000_000);

        let mut h = a.snapshot();
        h.merge(&b.snapshot());
        assert_eq!(3, h.count());
        assert!(h.quantile(1.0) >= 500_000);
    }

    #[test]
    fn huge_values_clamped() {
        let h = LogHistogram::default();
        h.record(u64::MAX);
        assert_eq!(1, h.snapshot().count());
    }
}
