pub mod jitter;

use std::sync::atomic::Ordering;

use tracing::{error, info, warn};

use crate::engine::Shared;
use crate::ring::SpscRing;
use crate::rt::guard::RealtimeGuard;
use crate::rt::locked::LockedBuffer;
use crate::rt::{self, cpu_relax, wait_until};
use crate::table::PmTableReader;

use self::jitter::JitterMonitor;

/// Upper bound on pm_table sensor slots (16 KiB of f32).
pub const MAX_SENSORS: usize = 4096;

/// Default SCHED_FIFO priority for the sampling thread.
pub const SAMPLER_PRIORITY: i32 = 98;

/// One timestamped snapshot of every sensor in the pm_table, tagged with
/// the stimulus phase observed at the same instant.
#[derive(Clone)]
pub struct RawSample {
    pub timestamp_ns: u64,
    pub worker_phase: u8,
    pub n: usize,
    pub values: [f32; MAX_SENSORS],
}

impl RawSample {
    pub fn empty() -> Self {
        Self {
            timestamp_ns: 0,
            worker_phase: 0,
            n: 0,
            values: [0.0; MAX_SENSORS],
        }
    }

    /// The valid prefix of the sensor array.
    pub fn sensor_values(&self) -> &[f32] {
        &self.values[..self.n]
    }
}

/// The 1 kHz real-time producer.
///
/// Runs pinned and priority-elevated on a dedicated measurement core,
/// reading the pm_table once per period into the SPSC ring. This is the
/// single real-time-critical path: after startup it never allocates, never
/// takes a lock and never drops a sample.
pub struct Sampler {
    pub core_id: i32,
    pub priority: i32,
    pub period_ns: u64,
}

impl Sampler {
    pub fn new(core_id: i32) -> Self {
        Self {
            core_id,
            priority: SAMPLER_PRIORITY,
            period_ns: 1_000_000,
        }
    }

    /// Run the sampling loop until the shared `run` flag clears.
    ///
    /// Waits politely for the `start` flag first so the enclosing engine
    /// can finish wiring consumers before the first sample.
    pub fn run(
        &self,
        reader: &mut PmTableReader,
        ring: &SpscRing<RawSample>,
        shared: &Shared,
        jitter: &mut JitterMonitor,
    ) {
        let _guard = RealtimeGuard::new(self.core_id, self.priority);

        while !shared.start.load(Ordering::Acquire) {
            if shared.terminate.load(Ordering::Acquire) {
                return;
            }
            cpu_relax();
        }

        let n = reader.num_sensors();
        if n > MAX_SENSORS {
            error!(
                sensors = n,
                max = MAX_SENSORS,
                "pm_table exceeds the RawSample buffer, refusing to sample",
            );
            return;
        }

        let size = reader.size();
        let mut scratch = LockedBuffer::new(size);

        info!(
            core = self.core_id,
            sensors = n,
            locked = scratch.is_locked(),
            "sampler started",
        );

        let mut next_deadline = rt::now_ns();
        let mut prev_timestamp = 0u64;

        while shared.run.load(Ordering::Acquire) {
            wait_until(next_deadline);
            next_deadline += self.period_ns;

            let timestamp_ns = rt::now_ns();
            let worker_phase = shared.worker_phase.load(Ordering::Relaxed);

            match reader.read(&mut scratch.as_mut_slice()[..size]) {
                Ok(()) => {
                    let mut sample = RawSample::empty();
                    sample.timestamp_ns = timestamp_ns;
                    sample.worker_phase = worker_phase;
                    sample.n = n;

                    let raw = &scratch.as_slice()[..size];
                    for (slot, chunk) in sample.values[..n].iter_mut().zip(raw.chunks_exact(4)) {
                        *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    }

                    // Ring full means the processor is behind; spin rather
                    // than drop, assuming the backlog is temporary.
                    let mut pending = sample;
                    loop {
                        match ring.push(pending) {
                            Ok(()) => break,
                            Err(back) => {
                                if !shared.run.load(Ordering::Acquire) {
                                    return;
                                }
                                pending = back;
                                cpu_relax();
                            }
                        }
                    }
                }
                // Skip the sample but keep the cadence.
                Err(e) => warn!(error = %e, "pm_table read failed, skipping sample"),
            }

            if prev_timestamp != 0 {
                let period_us = (timestamp_ns.saturating_sub(prev_timestamp) / 1_000) as i64;
                jitter.record_sample(period_us);
            }
            prev_timestamp = timestamp_ns;
        }

        info!(core = self.core_id, "sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn synthetic_table(dir: &std::path::Path, floats: &[f32]) -> PmTableReader {
        let table = dir.join("pm_table");
        let size = dir.join("pm_table_size");

        let mut f = File::create(&table).expect("create table");
        for v in floats {
            f.write_all(&v.to_le_bytes()).expect("write float");
        }
        let mut s = File::create(&size).expect("create size");
        s.write_all(&((floats.len() * 4) as u64).to_le_bytes())
            .expect("write size");

        PmTableReader::open(&table, &size).expect("open synthetic table")
    }

    #[test]
    fn test_sampler_produces_ordered_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut reader = synthetic_table(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let ring = Arc::new(SpscRing::new(600));
        let shared = Arc::new(Shared::new());
        shared.run.store(true, Ordering::Release);
        shared.start.store(true, Ordering::Release);

        let sampler_ring = Arc::clone(&ring);
        let sampler_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            let sampler = Sampler::new(-1);
            let mut jitter = JitterMonitor::new(1_000, 100_000, 100);
            sampler.run(&mut reader, &sampler_ring, &sampler_shared, &mut jitter);
        });

        thread::sleep(Duration::from_millis(50));
        shared.run.store(false, Ordering::Release);
        handle.join().expect("sampler thread");

        let mut last_ts = 0u64;
        let mut count = 0usize;
        while let Some(sample) = ring.pop() {
            assert!(sample.timestamp_ns >= last_ts, "timestamps must not go back");
            last_ts = sample.timestamp_ns;
            assert_eq!(sample.n, 4);
            assert_eq!(sample.sensor_values(), &[1.0, 2.0, 3.0, 4.0]);
            assert_eq!(sample.worker_phase, 0);
            count += 1;
        }
        assert!(count >= 10, "expected a burst of samples, got {count}");
    }

    #[test]
    fn test_sampler_exits_when_terminated_before_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut reader = synthetic_table(dir.path(), &[0.0; 4]);

        let ring = SpscRing::new(16);
        let shared = Shared::new();
        shared.terminate.store(true, Ordering::Release);

        let sampler = Sampler::new(-1);
        let mut jitter = JitterMonitor::new(1_000, 1_000, 100);
        // Must return without `start` ever being set.
        sampler.run(&mut reader, &ring, &shared, &mut jitter);
        assert!(ring.is_empty());
    }
}
