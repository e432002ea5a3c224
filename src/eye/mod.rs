pub mod display;
pub mod processor;

use std::collections::{HashMap, VecDeque};

/// The ordered set of "interesting" sensor channels under observation,
/// with the derived original-index to compact-storage-index mapping.
/// Immutable for the lifetime of the selection.
#[derive(Debug, Clone)]
pub struct SensorSelection {
    indices: Vec<usize>,
    storage_of: HashMap<usize, usize>,
}

impl SensorSelection {
    pub fn new(indices: Vec<usize>) -> Self {
        let storage_of = indices
            .iter()
            .enumerate()
            .map(|(storage, &original)| (original, storage))
            .collect();
        Self {
            indices,
            storage_of,
        }
    }

    /// Select every channel of an `n`-sensor table.
    pub fn all(n: usize) -> Self {
        Self::new((0..n).collect())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn original_indices(&self) -> &[usize] {
        &self.indices
    }

    /// Compact storage index for an original sensor index, if tracked.
    pub fn storage_index(&self, original: usize) -> Option<usize> {
        self.storage_of.get(&original).copied()
    }
}

/// Eye-window geometry and accumulation limits.
#[derive(Debug, Clone, Copy)]
pub struct EyeConfig {
    /// Pre-trigger window in ms (also the zero-offset bin).
    pub window_before_ms: u32,
    /// Post-trigger window in ms.
    pub window_after_ms: u32,
    /// Per-bin deque cap (FIFO eviction beyond this).
    pub max_accumulations: usize,
    /// Tail fraction removed on each side by the robust mean.
    pub trim_percent: f32,
}

impl Default for EyeConfig {
    fn default() -> Self {
        Self {
            window_before_ms: 50,
            window_after_ms: 150,
            max_accumulations: 30,
            trim_percent: 10.0,
        }
    }
}

impl EyeConfig {
    pub fn num_bins(&self) -> usize {
        (self.window_before_ms + self.window_after_ms) as usize
    }

    pub fn zero_offset_bins(&self) -> usize {
        self.window_before_ms as usize
    }
}

/// Per-sensor, per-bin bounded value queues accumulated across triggers.
pub struct EyeStorage {
    bins: Vec<Vec<VecDeque<f32>>>,
}

impl EyeStorage {
    pub fn new(num_sensors: usize, num_bins: usize) -> Self {
        Self {
            bins: (0..num_sensors)
                .map(|_| vec![VecDeque::new(); num_bins])
                .collect(),
        }
    }

    pub fn num_sensors(&self) -> usize {
        self.bins.len()
    }

    pub fn push(&mut self, sensor: usize, bin: usize, value: f32) {
        self.bins[sensor][bin].push_back(value);
    }

    pub fn bin(&self, sensor: usize, bin: usize) -> &VecDeque<f32> {
        &self.bins[sensor][bin]
    }

    /// FIFO-evict every bin down to `cap` entries.
    pub fn evict_to(&mut self, cap: usize) {
        for sensor_bins in &mut self.bins {
            for bin in sensor_bins {
                while bin.len() > cap {
                    bin.pop_front();
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for sensor_bins in &mut self.bins {
            for bin in sensor_bins {
                bin.clear();
            }
        }
    }
}
