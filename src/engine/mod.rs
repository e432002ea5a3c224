use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::command::CommandQueue;
use crate::config::Config;
use crate::error::TableError;
use crate::eye::display::DisplayBuffer;
use crate::eye::processor::Processor;
use crate::eye::SensorSelection;
use crate::ring::SpscRing;
use crate::rt::guard::RealtimeGuard;
use crate::rt::{self, wait_until};
use crate::sampler::{jitter::JitterMonitor, RawSample, Sampler};
use crate::stats::{StatsTable, Welford};
use crate::stimulus::{run_burst, BurstParams};
use crate::table::PmTableReader;

/// The process-wide coordination flags, bound to the engine's scope
/// instead of living as globals.
///
/// `worker_phase` is the stimulus square wave the sampler snapshots into
/// every sample; its 0 to 1 transition is the trigger. At most one burst
/// worker writes it at a time.
pub struct Shared {
    pub start: AtomicBool,
    pub run: AtomicBool,
    pub terminate: AtomicBool,
    pub worker_phase: AtomicU8,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            start: AtomicBool::new(false),
            run: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            worker_phase: AtomicU8::new(0),
        }
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep a requested victim core off the measurement core.
fn clamp_victim_core(requested: i32, measurement_core: i32, num_cores: usize) -> i32 {
    if requested != measurement_core {
        return requested;
    }

    let clamped = if (requested + 1) < num_cores as i32 {
        requested + 1
    } else {
        (requested - 1).max(0)
    };
    warn!(
        requested,
        clamped, "victim core equals measurement core, clamping to neighbor",
    );
    clamped
}

/// The wired-up sampling and attribution pipeline.
///
/// Owns the sampler and processor threads plus everything they share: the
/// SPSC ring, the display double buffer, the stats table and the command
/// queue. Shutdown joins stimulus, processor, then sampler.
pub struct Engine {
    shared: Arc<Shared>,
    display: Arc<DisplayBuffer>,
    stats: Arc<StatsTable>,
    commands: Arc<CommandQueue>,
    measurement_core: i32,
    burst: BurstParams,
    sampler_handle: Option<JoinHandle<()>>,
    processor_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the sampler and processor around `reader` and release the
    /// start flag once both are wired.
    pub fn start(cfg: &Config, mut reader: PmTableReader, selection: SensorSelection) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        shared.run.store(true, Ordering::Release);

        let ring: Arc<SpscRing<RawSample>> = Arc::new(SpscRing::new(cfg.sampling.ring_capacity));
        let eye_cfg = cfg.eye_config();
        let display = Arc::new(DisplayBuffer::new(&selection, &eye_cfg));
        let stats = Arc::new(StatsTable::new(cfg.correlation.history_depth));
        let commands = Arc::new(CommandQueue::new());

        let sampler = Sampler {
            core_id: cfg.sampling.measurement_core,
            priority: cfg.sampling.priority,
            period_ns: 1_000_000,
        };
        let mut jitter = JitterMonitor::new(
            1_000,
            cfg.sampling.jitter_report_interval,
            cfg.sampling.jitter_histogram_range_us,
        );

        let sampler_ring = Arc::clone(&ring);
        let sampler_shared = Arc::clone(&shared);
        let sampler_handle = thread::Builder::new()
            .name("smuscope-sampler".into())
            .spawn(move || {
                sampler.run(&mut reader, &sampler_ring, &sampler_shared, &mut jitter);
            })
            .context("spawning sampler thread")?;

        let processor = Processor::new(eye_cfg, selection);
        let proc_ring = Arc::clone(&ring);
        let proc_commands = Arc::clone(&commands);
        let proc_display = Arc::clone(&display);
        let proc_stats = Arc::clone(&stats);
        let proc_shared = Arc::clone(&shared);
        let processor_handle = thread::Builder::new()
            .name("smuscope-processor".into())
            .spawn(move || {
                processor.run(
                    &proc_ring,
                    &proc_commands,
                    &proc_display,
                    &proc_stats,
                    &proc_shared,
                );
            })
            .context("spawning processor thread")?;

        shared.start.store(true, Ordering::Release);
        info!(
            measurement_core = cfg.sampling.measurement_core,
            ring_capacity = cfg.sampling.ring_capacity,
            "engine started",
        );

        Ok(Self {
            shared,
            display,
            stats,
            commands,
            measurement_core: cfg.sampling.measurement_core,
            burst: cfg.burst_params(),
            sampler_handle: Some(sampler_handle),
            processor_handle: Some(processor_handle),
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn display(&self) -> &Arc<DisplayBuffer> {
        &self.display
    }

    pub fn stats(&self) -> &Arc<StatsTable> {
        &self.stats
    }

    pub fn commands(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    /// Run one Mode-A burst on `core`, blocking until it finishes. A
    /// request for the measurement core is clamped to a neighbor.
    pub fn run_burst_blocking(&self, core: i32) -> Result<()> {
        let num_cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let victim = clamp_victim_core(core, self.measurement_core, num_cores);

        let params = self.burst;
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("smuscope-burst".into())
            .spawn(move || {
                run_burst(victim, &params, &shared.worker_phase, &shared.terminate);
            })
            .context("spawning burst worker")?;

        if handle.join().is_err() {
            warn!(core = victim, "burst worker panicked");
        }
        Ok(())
    }

    /// Stop sampling and join the pipeline threads.
    pub fn shutdown(mut self) {
        info!("shutting down engine");
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.run.store(false, Ordering::Release);

        if let Some(handle) = self.processor_handle.take() {
            if handle.join().is_err() {
                warn!("processor thread panicked");
            }
        }
        if let Some(handle) = self.sampler_handle.take() {
            if handle.join().is_err() {
                warn!("sampler thread panicked");
            }
        }
        info!("engine stopped");
    }
}

/// Offline preflight: sample the table at 1 ms for `samples` iterations
/// and select the channels whose variance shows actual movement.
pub fn probe_interesting_sensors(
    reader: &mut PmTableReader,
    core_id: i32,
    samples: usize,
    variance_threshold: f64,
) -> crate::error::Result<Vec<usize>> {
    let _guard = RealtimeGuard::new(core_id, 98);

    let n = reader.num_sensors();
    let mut buf = vec![0u8; reader.size()];
    let mut stats = vec![Welford::default(); n];

    let mut deadline = rt::now_ns();
    for _ in 0..samples {
        wait_until(deadline);
        deadline += 1_000_000;

        match reader.read(&mut buf) {
            Ok(()) => {
                for (w, chunk) in stats.iter_mut().zip(buf.chunks_exact(4)) {
                    w.add(f64::from(f32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ])));
                }
            }
            Err(e @ TableError::UnderRead { .. }) => {
                warn!(error = %e, "probe read failed, skipping sample");
            }
            Err(e) => return Err(e),
        }
    }

    let interesting: Vec<usize> = stats
        .iter()
        .enumerate()
        .filter(|(_, w)| w.variance() > variance_threshold)
        .map(|(i, _)| i)
        .collect();

    info!(
        found = interesting.len(),
        total = n,
        "sensor variance probe complete",
    );

    Ok(interesting)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::command::Command;

    fn synthetic_table(dir: &Path, floats: &[f32]) -> PmTableReader {
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
    fn test_clamp_victim_core() {
        assert_eq!(clamp_victim_core(3, 0, 8), 3);
        assert_eq!(clamp_victim_core(0, 0, 8), 1);
        assert_eq!(clamp_victim_core(7, 7, 8), 6);
        assert_eq!(clamp_victim_core(0, 0, 1), 0);
    }

    #[test]
    fn test_engine_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader = synthetic_table(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let mut cfg = Config::default();
        cfg.sampling.measurement_core = -1;

        let selection = SensorSelection::all(4);
        let engine = Engine::start(&cfg, reader, selection).expect("engine start");

        std::thread::sleep(Duration::from_millis(60));

        // The pipeline is live: stats sized to the table, snapshots
        // published (still empty, no trigger has fired).
        assert_eq!(engine.stats().len(), 4);
        assert!(engine.display().read(0).expect("snapshot").x_ms.is_empty());

        engine.commands().push(Command::ChangeAccumulations(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(engine.commands().is_empty(), "processor drains commands");

        engine.shutdown();
    }

    #[test]
    fn test_probe_selects_only_moving_sensors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = dir.path().join("pm_table");
        let size = dir.path().join("pm_table_size");

        // Sensor 1 changes between reads; sensors 0 and 2 are constant.
        // The probe rereads the same file, so emulate movement by writing
        // the file from another thread while probing.
        let mut f = File::create(&table).expect("create table");
        f.write_all(&1.0f32.to_le_bytes()).expect("write");
        f.write_all(&0.0f32.to_le_bytes()).expect("write");
        f.write_all(&3.0f32.to_le_bytes()).expect("write");
        let mut s = File::create(&size).expect("create size");
        s.write_all(&12u64.to_le_bytes()).expect("write size");

        let writer_table = table.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..200u32 {
                let mut f = File::create(&writer_table).expect("rewrite table");
                f.write_all(&1.0f32.to_le_bytes()).expect("write");
                f.write_all(&(i as f32).to_le_bytes()).expect("write");
                f.write_all(&3.0f32.to_le_bytes()).expect("write");
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let mut reader = PmTableReader::open(&table, &size).expect("open");
        let interesting =
            probe_interesting_sensors(&mut reader, -1, 100, 1e-9).expect("probe");
        writer.join().expect("writer");

        assert!(interesting.contains(&1), "moving sensor must be selected");
        assert!(!interesting.contains(&0), "constant sensor must be skipped");
        assert!(!interesting.contains(&2), "constant sensor must be skipped");
    }
}
