use tracing::info;

/// Bounded jitter monitor for the sampler loop.
///
/// Every buffer is allocated at construction and reused: `record_sample`
/// performs only index writes and arithmetic, keeping the hot path free of
/// allocation. The expensive work (sorting for percentiles, logging) runs
/// once per report interval.
pub struct JitterMonitor {
    target_period_us: i64,
    report_interval: usize,
    histogram_range_us: i64,

    sample_count: usize,
    overruns: u64,
    sum_periods_us: f64,
    sum_squared_periods_us: f64,
    min_period_us: i64,
    max_period_us: i64,
    histogram: Vec<u32>,

    // Scratch for percentile computation; never resized after construction.
    periods_us: Vec<i64>,
}

impl JitterMonitor {
    /// `target_period_us` centers the histogram; a report is emitted every
    /// `report_interval` samples; the histogram covers +/- `range_us` of
    /// deviation from the target.
    pub fn new(target_period_us: i64, report_interval: usize, range_us: i64) -> Self {
        let mut monitor = Self {
            target_period_us,
            report_interval,
            histogram_range_us: range_us,
            sample_count: 0,
            overruns: 0,
            sum_periods_us: 0.0,
            sum_squared_periods_us: 0.0,
            min_period_us: i64::MAX,
            max_period_us: 0,
            histogram: vec![0; (2 * range_us + 1) as usize],
            periods_us: vec![0; report_interval],
        };
        monitor.reset();
        monitor
    }

    /// Record one measured period. Allocation-free.
    pub fn record_sample(&mut self, period_us: i64) {
        if self.sample_count < self.report_interval {
            self.periods_us[self.sample_count] = period_us;
        }

        self.sum_periods_us += period_us as f64;
        self.sum_squared_periods_us += (period_us as f64) * (period_us as f64);

        if period_us < self.min_period_us {
            self.min_period_us = period_us;
        }
        if period_us > self.max_period_us {
            self.max_period_us = period_us;
        }
        if period_us > self.target_period_us {
            self.overruns += 1;
        }

        let jitter_us = period_us - self.target_period_us;
        let bin = jitter_us + self.histogram_range_us;
        if bin >= 0 && (bin as usize) < self.histogram.len() {
            self.histogram[bin as usize] += 1;
        }

        self.sample_count += 1;

        if self.sample_count >= self.report_interval {
            self.report_and_reset();
        }
    }

    /// Total periods that exceeded the target, across all intervals.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    fn report_and_reset(&mut self) {
        if self.sample_count == 0 {
            return;
        }

        let n = self.sample_count;
        let mean = self.sum_periods_us / n as f64;
        let variance = (self.sum_squared_periods_us / n as f64 - mean * mean).max(0.0);
        let stddev = variance.sqrt();

        // Percentiles need a sort; this runs once per interval, off the
        // sample path's fast case.
        let periods = &mut self.periods_us[..n];
        periods.sort_unstable();
        let p1 = periods[(0.01 * (n - 1) as f64) as usize];
        let p50 = periods[(0.50 * (n - 1) as f64) as usize];
        let p99 = periods[(0.99 * (n - 1) as f64) as usize];

        info!(
            samples = n,
            mean_us = %format_args!("{mean:.3}"),
            stddev_us = %format_args!("{stddev:.3}"),
            min_us = self.min_period_us,
            max_us = self.max_period_us,
            p1_us = p1,
            p50_us = p50,
            p99_us = p99,
            overruns = self.overruns,
            "sampler jitter stats",
        );

        for (bin, &hits) in self.histogram.iter().enumerate() {
            if hits > 0 {
                let deviation = bin as i64 - self.histogram_range_us;
                tracing::debug!(deviation_us = deviation, hits, "jitter bin");
            }
        }

        self.reset();
    }

    fn reset(&mut self) {
        self.sample_count = 0;
        self.sum_periods_us = 0.0;
        self.sum_squared_periods_us = 0.0;
        self.min_period_us = i64::MAX;
        self.max_period_us = 0;
        self.histogram.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_overruns_across_intervals() {
        let mut m = JitterMonitor::new(1_000, 4, 100);
        // One full interval plus two samples; overruns persist across the
        // interval reset.
        for p in [1_001, 999, 1_050, 1_000, 1_002, 998] {
            m.record_sample(p);
        }
        assert_eq!(m.overruns(), 3);
    }

    #[test]
    fn test_interval_reset_clears_window_state() {
        let mut m = JitterMonitor::new(1_000, 3, 100);
        m.record_sample(900);
        m.record_sample(1_100);
        m.record_sample(1_000);
        // Report fired; window state is reset.
        assert_eq!(m.sample_count, 0);
        assert_eq!(m.min_period_us, i64::MAX);
        assert!(m.histogram.iter().all(|&h| h == 0));
    }

    #[test]
    fn test_out_of_range_jitter_not_binned() {
        let mut m = JitterMonitor::new(1_000, 10, 50);
        m.record_sample(2_000); // +1000 us, far outside +/-50
        assert!(m.histogram.iter().all(|&h| h == 0));
        assert_eq!(m.sample_count, 1);
    }
}
