use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::command::{Command, CommandQueue};
use crate::engine::Shared;
use crate::ring::SpscRing;
use crate::sampler::RawSample;
use crate::stats::{trimmed_mean, StatsTable};

use super::display::DisplayBuffer;
use super::{EyeConfig, EyeStorage, SensorSelection};

/// Extra samples kept in the history ring beyond the eye window.
const HISTORY_MARGIN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Millisecond offset of a sample relative to the trigger. Truncates
/// toward zero, matching the 1 ms sample grid.
fn delta_ms(timestamp_ns: u64, trigger_ns: u64) -> i64 {
    (timestamp_ns as i64 - trigger_ns as i64) / 1_000_000
}

/// The consumer of the sample stream.
///
/// Maintains the eye accumulator, detects rising edges of the stimulus
/// phase, captures one window per trigger and publishes render-ready
/// per-sensor snapshots through the display double buffer. Also feeds the
/// shared stats table the correlation engine reads from.
///
/// A rising edge observed while a capture is in flight restarts the
/// capture: the trigger time moves to the new edge and the in-progress
/// trace is discarded without back-filling.
pub struct Processor {
    cfg: EyeConfig,
    selection: SensorSelection,
    storage: EyeStorage,

    /// Recent raw samples; sized to cover the whole eye window plus
    /// margin so pre-trigger bins can be back-filled at finalization.
    history: VecDeque<RawSample>,
    history_cap: usize,

    current_trace: Vec<RawSample>,
    state: CaptureState,
    trigger_time_ns: u64,
    last_phase: u8,
    max_accumulations: usize,

    /// Side of the display buffer to write next (the unpublished one).
    write_side: usize,
    scratch: Vec<f32>,
}

impl Processor {
    pub fn new(cfg: EyeConfig, selection: SensorSelection) -> Self {
        let history_cap =
            (cfg.window_before_ms + cfg.window_after_ms) as usize + HISTORY_MARGIN;

        Self {
            storage: EyeStorage::new(selection.len(), cfg.num_bins()),
            history: VecDeque::with_capacity(history_cap + 1),
            history_cap,
            current_trace: Vec::with_capacity(cfg.window_after_ms as usize + 50),
            state: CaptureState::Idle,
            trigger_time_ns: 0,
            last_phase: 0,
            max_accumulations: cfg.max_accumulations.max(1),
            write_side: 1,
            scratch: Vec::new(),
            cfg,
            selection,
        }
    }

    pub fn capture_state(&self) -> CaptureState {
        self.state
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn trace_len(&self) -> usize {
        self.current_trace.len()
    }

    pub fn max_accumulations(&self) -> usize {
        self.max_accumulations
    }

    /// Depth of one accumulator bin (storage index, bin index).
    pub fn bin_len(&self, sensor: usize, bin: usize) -> usize {
        self.storage.bin(sensor, bin).len()
    }

    /// Apply one control command.
    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ChangeVictimCore(core) => {
                info!(core, "processing command: change victim core");
                self.storage.clear();
                self.history.clear();
                self.current_trace.clear();
                self.state = CaptureState::Idle;
            }
            Command::ChangeAccumulations(cap) => {
                info!(cap, "processing command: change accumulation depth");
                self.max_accumulations = cap.max(1);
            }
        }
    }

    /// Feed one sample through the capture state machine. Returns true
    /// when this sample completed a capture (a snapshot was published).
    pub fn process_sample(&mut self, sample: &RawSample, display: &DisplayBuffer) -> bool {
        self.history.push_back(sample.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }

        if sample.worker_phase == 1 && self.last_phase == 0 {
            self.state = CaptureState::Capturing;
            self.trigger_time_ns = sample.timestamp_ns;
            self.current_trace.clear();
        }
        self.last_phase = sample.worker_phase;

        if self.state != CaptureState::Capturing {
            return false;
        }

        let delta = delta_ms(sample.timestamp_ns, self.trigger_time_ns);
        let after = i64::from(self.cfg.window_after_ms);

        if (0..after).contains(&delta) {
            self.current_trace.push(sample.clone());
            false
        } else if delta >= after {
            self.state = CaptureState::Idle;
            self.finalize(display);
            true
        } else {
            false
        }
    }

    /// Bin the completed capture, evict, and publish fresh snapshots.
    fn finalize(&mut self, display: &DisplayBuffer) {
        let num_bins = self.cfg.num_bins() as i64;
        let zero = self.cfg.zero_offset_bins();
        let trigger = self.trigger_time_ns;

        // The history ring covers the whole window, so the trace only
        // contributes samples older than the history's oldest entry (it
        // would otherwise double-bin the overlap).
        let oldest_history = self.history.front().map(|s| s.timestamp_ns);
        let older_trace = self
            .current_trace
            .iter()
            .filter(|s| oldest_history.map_or(true, |oldest| s.timestamp_ns < oldest));

        for sample in older_trace.chain(self.history.iter()) {
            let bin = delta_ms(sample.timestamp_ns, trigger) + zero as i64;
            if !(0..num_bins).contains(&bin) {
                continue;
            }
            for (storage_idx, &original) in self.selection.original_indices().iter().enumerate() {
                if original < sample.n {
                    self.storage
                        .push(storage_idx, bin as usize, sample.values[original]);
                }
            }
        }

        self.storage.evict_to(self.max_accumulations);

        let side = self.write_side;
        for (storage_idx, &original) in self.selection.original_indices().iter().enumerate() {
            display.with_write_slot(side, storage_idx, |snap| {
                snap.clear();
                snap.window_before_ms = self.cfg.window_before_ms;
                snap.window_after_ms = self.cfg.window_after_ms;
                snap.original_sensor_index = original;
                snap.accumulation_count = self.storage.bin(storage_idx, zero).len();

                for bin_idx in 0..self.cfg.num_bins() {
                    let bin = self.storage.bin(storage_idx, bin_idx);
                    if bin.is_empty() {
                        continue;
                    }

                    self.scratch.clear();
                    self.scratch.extend(bin.iter().copied());

                    snap.x_ms.push(bin_idx as i32 - zero as i32);
                    snap.y_mean
                        .push(trimmed_mean(&self.scratch, self.cfg.trim_percent));
                    snap.y_min
                        .push(bin.iter().copied().fold(f32::INFINITY, f32::min));
                    snap.y_max
                        .push(bin.iter().copied().fold(f32::NEG_INFINITY, f32::max));
                }
            });
        }

        // Publish after every sensor is fully written, then flip sides.
        for storage_idx in 0..self.selection.len() {
            display.publish(side, storage_idx);
        }
        self.write_side ^= 1;
    }

    /// Consumer loop: drain commands, drain the ring, sleep briefly when
    /// idle. Exits when the shared terminate flag is set.
    pub fn run(
        mut self,
        ring: &SpscRing<RawSample>,
        commands: &CommandQueue,
        display: &DisplayBuffer,
        stats: &StatsTable,
        shared: &Shared,
    ) {
        info!(sensors = self.selection.len(), "processor started");

        while !shared.terminate.load(Ordering::Acquire) {
            while let Some(cmd) = commands.try_pop() {
                self.handle_command(cmd);
            }

            let mut work_done = false;
            while let Some(sample) = ring.pop() {
                work_done = true;
                stats.record(sample.timestamp_ns, sample.sensor_values());
                self.process_sample(&sample, display);
            }

            if !work_done {
                thread::sleep(Duration::from_millis(5));
            }
        }

        info!("processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, phase: u8, value: f32) -> RawSample {
        let mut s = RawSample::empty();
        s.timestamp_ns = ms * 1_000_000;
        s.worker_phase = phase;
        s.n = 1;
        s.values[0] = value;
        s
    }

    fn small_cfg() -> EyeConfig {
        EyeConfig {
            window_before_ms: 5,
            window_after_ms: 10,
            max_accumulations: 4,
            trim_percent: 10.0,
        }
    }

    fn setup() -> (Processor, DisplayBuffer) {
        let cfg = small_cfg();
        let selection = SensorSelection::new(vec![0]);
        let display = DisplayBuffer::new(&selection, &cfg);
        (Processor::new(cfg, selection), display)
    }

    #[test]
    fn test_rising_edge_starts_capture() {
        let (mut p, display) = setup();
        assert_eq!(p.capture_state(), CaptureState::Idle);

        p.process_sample(&sample(0, 0, 1.0), &display);
        assert_eq!(p.capture_state(), CaptureState::Idle);

        p.process_sample(&sample(1, 1, 2.0), &display);
        assert_eq!(p.capture_state(), CaptureState::Capturing);
        assert_eq!(p.trace_len(), 1);
    }

    #[test]
    fn test_high_phase_without_edge_does_not_trigger() {
        let (mut p, display) = setup();
        p.process_sample(&sample(0, 1, 0.0), &display);
        assert_eq!(p.capture_state(), CaptureState::Capturing);
        p.process_sample(&sample(1, 0, 0.0), &display);
        p.process_sample(&sample(2, 1, 0.0), &display);
        // 0 -> 1 again: a fresh trigger, not a continuation.
        assert_eq!(p.trace_len(), 1);
    }

    #[test]
    fn test_capture_finalizes_after_window() {
        let (mut p, display) = setup();
        let mut finalized = false;
        for ms in 0..30 {
            let phase = u8::from(ms >= 5 && ms < 12);
            finalized |= p.process_sample(&sample(ms, phase, 1.0), &display);
        }
        assert!(finalized);
        assert_eq!(p.capture_state(), CaptureState::Idle);

        let snap = display.read(0).expect("snapshot");
        assert!(!snap.x_ms.is_empty());
    }

    #[test]
    fn test_overlapping_trigger_restarts_capture() {
        let (mut p, display) = setup();
        p.process_sample(&sample(0, 0, 0.0), &display);
        p.process_sample(&sample(1, 1, 0.0), &display); // first trigger
        p.process_sample(&sample(2, 1, 0.0), &display);
        p.process_sample(&sample(3, 0, 0.0), &display);
        assert_eq!(p.trace_len(), 3);

        // Second edge before the first window elapsed.
        let finalized = p.process_sample(&sample(4, 1, 0.0), &display);
        assert!(!finalized, "restart must not finalize the aborted capture");
        assert_eq!(p.capture_state(), CaptureState::Capturing);
        assert_eq!(p.trace_len(), 1, "trace restarts at the new trigger");
    }

    #[test]
    fn test_change_victim_clears_all_state() {
        let (mut p, display) = setup();
        for ms in 0..8 {
            p.process_sample(&sample(ms, u8::from(ms >= 3), 1.0), &display);
        }
        assert_eq!(p.capture_state(), CaptureState::Capturing);
        assert!(p.history_len() > 0);

        p.handle_command(Command::ChangeVictimCore(2));
        assert_eq!(p.capture_state(), CaptureState::Idle);
        assert_eq!(p.history_len(), 0);
        assert_eq!(p.trace_len(), 0);
        for bin in 0..p.cfg.num_bins() {
            assert_eq!(p.bin_len(0, bin), 0);
        }
    }

    #[test]
    fn test_change_accumulations_updates_cap() {
        let (mut p, _display) = setup();
        p.handle_command(Command::ChangeAccumulations(7));
        assert_eq!(p.max_accumulations(), 7);
        // A zero cap is clamped rather than discarding everything forever.
        p.handle_command(Command::ChangeAccumulations(0));
        assert_eq!(p.max_accumulations(), 1);
    }

    #[test]
    fn test_unknown_sensor_indices_ignored() {
        let cfg = small_cfg();
        // Track a sensor beyond the sample's valid prefix.
        let selection = SensorSelection::new(vec![3]);
        let display = DisplayBuffer::new(&selection, &cfg);
        let mut p = Processor::new(cfg, selection);

        for ms in 0..30 {
            let phase = u8::from(ms >= 5 && ms < 12);
            p.process_sample(&sample(ms, phase, 1.0), &display); // n == 1
        }

        let snap = display.read(0).expect("snapshot");
        assert!(snap.x_ms.is_empty(), "untracked sensor emits no bins");
    }
}
