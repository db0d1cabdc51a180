use hdrhistogram::Histogram;

/// Upper bound for recorded throughput samples.
const SAMPLES: u64 = 100_000_000;

/// Sample recorder behind the Req/Sec row of the report: one throughput
/// sample per worker per sampling interval, aggregated process-wide.
#[derive(Debug, Clone)]
pub struct Stats {
    hist: Histogram<u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            hist: Histogram::new_with_bounds(1, SAMPLES, 3).expect("histogram bounds are valid"),
        }
    }

    pub fn record(&mut self, value: u64) {
        self.hist.saturating_record(value);
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn min(&self) -> u64 {
        if self.hist.is_empty() {
            0
        } else {
            self.hist.min()
        }
    }

    pub fn max(&self) -> u64 {
        if self.hist.is_empty() {
            0
        } else {
            self.hist.max()
        }
    }

    pub fn mean(&self) -> f64 {
        self.hist.mean()
    }

    pub fn stdev(&self) -> f64 {
        self.hist.stdev()
    }

    /// Percentage of samples within `band` standard deviations of the mean.
    pub fn within_stdev(&self, mean: f64, stdev: f64, band: f64) -> f64 {
        if self.hist.is_empty() {
            return 0.0;
        }

        let lower = mean - band * stdev;
        let upper = mean + band * stdev;
        let mut within = 0u64;

        for v in self.hist.iter_recorded() {
            let value = v.value_iterated_to() as f64;
            if value >= lower && value <= upper {
                within += v.count_at_value();
            }
        }

        within as f64 / self.hist.len() as f64 * 100.0
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.hist
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Error taxonomy surfaced in the final report. `established` counts
/// successful handshakes, not failures.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Errors {
    pub connect: u64,
    pub read: u64,
    pub write: u64,
    pub timeout: u64,
    pub status: u64,
    pub established: u64,
    pub reconnect: u64,
}

impl Errors {
    pub fn merge(&mut self, other: &Errors) {
        self.connect += other.connect;
        self.read += other.read;
        self.write += other.write;
        self.timeout += other.timeout;
        self.status += other.status;
        self.established += other.established;
        self.reconnect += other.reconnect;
    }

    pub fn any_socket_errors(&self) -> bool {
        self.connect != 0
            || self.read != 0
            || self.write != 0
            || self.timeout != 0
            || self.reconnect != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarizes_samples() {
        let mut stats = Stats::new();
        for v in [100, 100, 100, 100, 1000] {
            stats.record(v);
        }

        assert_eq!(stats.count(), 5);
        assert_eq!(stats.max(), 1000);
        assert!((stats.mean() - 280.0).abs() / 280.0 < 0.01);

        let within = stats.within_stdev(stats.mean(), stats.stdev(), 1.0);
        assert!((within - 80.0).abs() < 1.0);
    }

    #[test]
    fn merges_error_counters() {
        let mut a = Errors {
            connect: 1,
            read: 2,
            established: 10,
            ..Errors::default()
        };
        let b = Errors {
            connect: 3,
            reconnect: 4,
            ..Errors::default()
        };

        a.merge(&b);
        assert_eq!(a.connect, 4);
        assert_eq!(a.read, 2);
        assert_eq!(a.reconnect, 4);
        assert_eq!(a.established, 10);
        assert!(a.any_socket_errors());
    }
}
