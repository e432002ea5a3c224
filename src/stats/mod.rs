use std::collections::VecDeque;

use parking_lot::Mutex;

/// Maximum number of ranked core attributions kept per sensor.
pub const MAX_TOP_CORRELATIONS: usize = 4;

/// Robust average: mean of the central fraction of the sorted input.
///
/// `trim_percent` of the samples is removed from each tail before
/// averaging. When trimming would remove everything, falls back to the
/// median.
pub fn trimmed_mean(values: &[f32], trim_percent: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);

    let n = sorted.len();
    let k = ((trim_percent / 100.0) * n as f32) as usize;

    if 2 * k >= n {
        return if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
    }

    let kept = &sorted[k..n - k];
    let sum: f64 = kept.iter().map(|&v| f64::from(v)).sum();
    (sum / kept.len() as f64) as f32
}

/// Running `(count, mean, m2)` aggregate sufficient for one-pass mean and
/// variance without catastrophic cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero below two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// One ranked sensor-to-core attribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationInfo {
    pub core_id: i32,
    /// Attribution strength in [0, 1].
    pub strength: f32,
    /// Confidence in the attribution, in [0, 1].
    pub quality: f32,
}

/// Per-sensor running statistics and attribution state.
///
/// `history` is the bounded window the correlation engine operates on; it
/// is cleared between measurement phases while the lifetime aggregates
/// (`min`/`max`/Welford) keep accumulating.
#[derive(Debug, Clone)]
pub struct CellStats {
    pub current: f32,
    pub min: f32,
    pub max: f32,
    welford: Welford,
    pub history: VecDeque<(u64, f32)>,
    pub top_correlations: Vec<CorrelationInfo>,
}

impl Default for CellStats {
    fn default() -> Self {
        Self {
            current: 0.0,
            min: f32::MAX,
            max: f32::MIN,
            welford: Welford::default(),
            history: VecDeque::new(),
            top_correlations: Vec::new(),
        }
    }
}

impl CellStats {
    pub fn add_sample(&mut self, timestamp_ns: u64, value: f32, history_cap: usize) {
        self.current = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }

        self.welford.add(f64::from(value));

        self.history.push_back((timestamp_ns, value));
        while self.history.len() > history_cap {
            self.history.pop_front();
        }
    }

    pub fn count(&self) -> u64 {
        self.welford.count()
    }

    pub fn mean(&self) -> f64 {
        self.welford.mean()
    }

    /// Lifetime standard deviation.
    pub fn stddev(&self) -> f64 {
        self.welford.stddev()
    }

    /// Standard deviation of the current history window only.
    pub fn history_stddev(&self) -> f32 {
        let mut w = Welford::default();
        for &(_, v) in &self.history {
            w.add(f64::from(v));
        }
        w.stddev() as f32
    }

    /// Update the attribution entry for `core_id` or append a new one, then
    /// re-sort descending by strength and truncate to the top four.
    pub fn update_or_insert(&mut self, core_id: i32, strength: f32, quality: f32) {
        match self
            .top_correlations
            .iter_mut()
            .find(|c| c.core_id == core_id)
        {
            Some(entry) => {
                entry.strength = strength;
                entry.quality = quality;
            }
            None => self.top_correlations.push(CorrelationInfo {
                core_id,
                strength,
                quality,
            }),
        }

        self.top_correlations
            .sort_by(|a, b| b.strength.total_cmp(&a.strength));
        self.top_correlations.truncate(MAX_TOP_CORRELATIONS);
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared per-sensor statistics table fed by the processing pipeline and
/// read/mutated by the correlation engine. A single mutex over the dense
/// vector: cells are indexed by original sensor position.
pub struct StatsTable {
    cells: Mutex<Vec<CellStats>>,
    history_cap: usize,
}

impl StatsTable {
    pub fn new(history_cap: usize) -> Self {
        Self {
            cells: Mutex::new(Vec::new()),
            history_cap,
        }
    }

    /// Record one sample vector, sizing the table on first use.
    pub fn record(&self, timestamp_ns: u64, values: &[f32]) {
        let mut cells = self.cells.lock();
        if cells.len() != values.len() {
            cells.resize_with(values.len(), CellStats::default);
        }

        for (cell, &value) in cells.iter_mut().zip(values) {
            cell.add_sample(timestamp_ns, value, self.history_cap);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every cell.
    pub fn snapshot(&self) -> Vec<CellStats> {
        self.cells.lock().clone()
    }

    /// Clear every cell's history window (phase boundary in a sweep).
    pub fn clear_histories(&self) {
        for cell in self.cells.lock().iter_mut() {
            cell.clear_history();
        }
    }

    /// Stddev of each cell's current history window.
    pub fn history_stddevs(&self) -> Vec<f32> {
        self.cells.lock().iter().map(CellStats::history_stddev).collect()
    }

    /// Drop all ranked attributions (start of a fresh analysis run).
    pub fn clear_correlations(&self) {
        for cell in self.cells.lock().iter_mut() {
            cell.top_correlations.clear();
        }
    }

    pub fn update_correlation(&self, sensor: usize, core_id: i32, strength: f32, quality: f32) {
        let mut cells = self.cells.lock();
        if let Some(cell) = cells.get_mut(sensor) {
            cell.update_or_insert(core_id, strength, quality);
        }
    }

    pub fn reset(&self) {
        for cell in self.cells.lock().iter_mut() {
            cell.reset();
        }
    }
}
