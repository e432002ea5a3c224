use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::rt;

/// Pin the calling thread to one logical core. Best-effort.
fn pin_current_thread(core_id: usize) -> bool {
    let mut set = CpuSet::new();
    if set.set(core_id).is_err() {
        return false;
    }
    sched_setaffinity(Pid::from_raw(0), &set).is_ok()
}

/// Tight integer loop that keeps the ALUs busy without touching memory.
pub fn integer_alu_workload(iterations: i64) {
    let mut a: i64 = 0;
    let mut b: i64 = 1;
    let mut c: i64 = 2;
    let mut d: i64 = 3;
    for i in 0..iterations {
        a = black_box(a.wrapping_add(i));
        b = black_box(b.wrapping_add(a));
        c = black_box(c.wrapping_sub(b));
        d = black_box(d.wrapping_mul(c));
    }
    black_box(d);
}

/// Floating-point churn used by the per-core square-wave workers.
fn float_workload(iterations: i64) {
    let mut val = black_box(1.2345f64);
    for _ in 0..iterations {
        val *= 1.00001;
        val /= 1.000009;
    }
    black_box(val);
}

/// Duty-cycled burst parameters (eye-diagram stimulus).
#[derive(Debug, Clone, Copy)]
pub struct BurstParams {
    pub period_ms: u64,
    /// Busy fraction of each period, 10..=90.
    pub duty_percent: u32,
    pub cycles: u32,
}

impl Default for BurstParams {
    fn default() -> Self {
        Self {
            period_ms: 150,
            duty_percent: 50,
            cycles: 30,
        }
    }
}

/// Resets the shared worker phase to idle on every exit path.
///
/// The processor's edge detection relies on the phase returning to 0 after
/// a burst; this must hold even when the worker unwinds.
struct PhaseReset<'a>(&'a AtomicU8);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Run one duty-cycled burst on the victim core.
///
/// Each cycle raises the shared phase, busy-loops the integer workload for
/// the duty portion of the period, drops the phase and sleeps the
/// remainder. The rising edges are the processor's triggers.
pub fn run_burst(core_id: i32, params: &BurstParams, phase: &AtomicU8, terminate: &AtomicBool) {
    if core_id >= 0 && !pin_current_thread(core_id as usize) {
        warn!(core = core_id, "failed to pin burst worker");
    }

    let _reset = PhaseReset(phase);

    let period_ns = params.period_ms * 1_000_000;
    let busy_ns = period_ns * u64::from(params.duty_percent) / 100;
    let wait_ns = period_ns - busy_ns;

    for _ in 0..params.cycles {
        if terminate.load(Ordering::Relaxed) {
            break;
        }

        phase.store(1, Ordering::Relaxed);
        let busy_start = rt::now_ns();
        while rt::now_ns() - busy_start < busy_ns {
            integer_alu_workload(1_000);
        }

        phase.store(0, Ordering::Relaxed);
        thread::sleep(Duration::from_nanos(wait_ns));
    }
}

/// Consecutive odd primes starting at 11, doubled into millisecond
/// periods. No two results share a small-integer ratio, which keeps the
/// per-core square waves out of lockstep.
fn generate_prime_periods(n: usize) -> Vec<u64> {
    let mut periods = Vec::with_capacity(n);
    let mut num = 11u64;
    while periods.len() < n {
        let mut is_prime = true;
        let mut i = 2u64;
        while i * i <= num {
            if num % i == 0 {
                is_prime = false;
                break;
            }
            i += 1;
        }
        if is_prime {
            periods.push(num * 2);
        }
        num += 2;
    }
    periods
}

/// Callback invoked inside each stress worker before its scheduling loop,
/// with the worker's id. The default pins the worker to its core.
pub type WorkerStartHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Per-core square-wave stimulus (correlation mode).
///
/// One permanently-running worker per logical core, each with a distinct
/// prime-derived period: 1/3 of the period busy, 2/3 idle. A worker whose
/// `is_busy` flag is cleared keeps its scheduling loop but skips the work,
/// so the correlation engine can hold cores at idle selectively. The busy
/// intent per core persists across stop/start.
pub struct StressTester {
    num_cores: usize,
    periods_ms: Vec<u64>,
    /// Persistent per-core intent, surviving stop/start.
    busy_states: Vec<AtomicBool>,
    /// Live flags the running workers poll.
    live_busy: Vec<Arc<AtomicBool>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
    start_time_ns: AtomicU64,
    on_worker_start: WorkerStartHook,
}

impl StressTester {
    pub fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            periods_ms: generate_prime_periods(num_cores),
            busy_states: (0..num_cores).map(|_| AtomicBool::new(true)).collect(),
            live_busy: (0..num_cores)
                .map(|_| Arc::new(AtomicBool::new(true)))
                .collect(),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            running: false,
            start_time_ns: AtomicU64::new(0),
            on_worker_start: Arc::new(|worker_id| {
                if !pin_current_thread(worker_id) {
                    warn!(core = worker_id, "failed to pin stress worker");
                }
            }),
        }
    }

    /// Replace the per-worker startup hook (affinity / priority policy).
    pub fn with_worker_start_hook(mut self, hook: WorkerStartHook) -> Self {
        self.on_worker_start = hook;
        self
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }

        info!(cores = self.num_cores, "starting stress workers");
        self.stop.store(false, Ordering::Release);
        self.start_time_ns.store(rt::now_ns(), Ordering::Release);

        for core in 0..self.num_cores {
            // Seed the live flag from the persistent intent.
            let live = Arc::clone(&self.live_busy[core]);
            live.store(self.busy_states[core].load(Ordering::Relaxed), Ordering::Release);

            let stop = Arc::clone(&self.stop);
            let period_ms = self.periods_ms[core];
            let hook = Arc::clone(&self.on_worker_start);

            self.threads.push(thread::spawn(move || {
                hook(core);
                stress_worker(period_ms, &stop, &live);
            }));

            info!(core, period_ms, "stress worker started");
        }

        self.running = true;
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        info!("stopping stress workers");
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                warn!(?e, "stress worker panicked");
            }
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn core_count(&self) -> usize {
        self.num_cores
    }

    pub fn periods_ms(&self) -> &[u64] {
        &self.periods_ms
    }

    /// Monotonic timestamp of the most recent `start`.
    pub fn start_time_ns(&self) -> u64 {
        self.start_time_ns.load(Ordering::Acquire)
    }

    /// Set a worker's busy intent; applied live when running.
    pub fn set_busy(&self, core: usize, busy: bool) {
        if core >= self.num_cores {
            return;
        }
        self.busy_states[core].store(busy, Ordering::Relaxed);
        self.live_busy[core].store(busy, Ordering::Relaxed);
    }

    /// The persistent busy intent for a core.
    pub fn busy_state(&self, core: usize) -> bool {
        self.busy_states
            .get(core)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

impl Drop for StressTester {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The scheduling loop of one stress worker: 1/3 work, 2/3 idle, every
/// period, whether or not the work actually runs.
fn stress_worker(period_ms: u64, stop: &AtomicBool, is_busy: &AtomicBool) {
    let period_ns = period_ms * 1_000_000;
    let work_ns = period_ns / 3;

    while !stop.load(Ordering::Relaxed) {
        let loop_start = rt::now_ns();
        let work_end = loop_start + work_ns;
        let loop_end = loop_start + period_ns;

        if is_busy.load(Ordering::Relaxed) {
            while rt::now_ns() < work_end {
                float_workload(500);
            }
        }

        let now = rt::now_ns();
        if now < loop_end {
            thread::sleep(Duration::from_nanos(loop_end - now));
        }
    }
}
