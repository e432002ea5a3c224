use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smuscope::correlate::{run_sweep, SweepConfig};
use smuscope::rt;
use smuscope::stats::StatsTable;
use smuscope::stimulus::StressTester;

/// Square wave of one stress worker at a given instant: busy intent AND
/// inside the work third of its period.
fn worker_wave(tester: &StressTester, core: usize, now_ns: u64) -> f32 {
    if !tester.busy_state(core) {
        return 0.0;
    }
    let period_ns = tester.periods_ms()[core] * 1_000_000;
    let phase = now_ns % period_ns;
    f32::from(u8::from(phase < period_ns / 3))
}

/// Full sweep over a synthetic sensor that mirrors core 5's activity: the
/// sweep must attribute the sensor to core 5 with near-full strength.
#[test]
fn sweep_recovers_synthetic_core_sensor() {
    const CORES: usize = 6;
    const TARGET: usize = 5;

    let tester = Arc::new(StressTester::new(CORES));
    let stats = Arc::new(StatsTable::new(4096));
    let terminate = Arc::new(AtomicBool::new(false));

    // Feed the stats table at ~1 kHz with a sensor that is exactly the
    // target worker's busy wave, plus a constant channel as control.
    let feeder_stop = Arc::new(AtomicBool::new(false));
    let feeder = {
        let tester = Arc::clone(&tester);
        let stats = Arc::clone(&stats);
        let stop = Arc::clone(&feeder_stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let now = rt::now_ns();
                stats.record(now, &[worker_wave(&tester, TARGET, now), 42.0]);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    // Scaled-down sweep timing keeps the test fast; each active window
    // still spans more than one full period of the target wave.
    let cfg = SweepConfig {
        baseline: Duration::from_millis(60),
        active: Duration::from_millis(150),
        update_interval: Duration::from_millis(5),
    };

    run_sweep(&tester, &stats, &terminate, &cfg);

    feeder_stop.store(true, Ordering::Relaxed);
    feeder.join().expect("feeder thread");

    let cells = stats.snapshot();
    let top = cells[0]
        .top_correlations
        .first()
        .expect("sensor 0 has attributions");
    assert_eq!(top.core_id, TARGET as i32, "wrong core attributed");
    assert!(top.strength >= 0.9, "strength {} below 0.9", top.strength);
    assert!(top.quality > 0.0);

    // The constant control channel must not point at the target core with
    // any meaningful strength.
    if let Some(control_top) = cells[1].top_correlations.first() {
        assert!(control_top.strength < 0.1);
    }

    // Universal bounds: strengths and qualities in [0, 1], descending
    // order, at most four entries.
    for cell in &cells {
        assert!(cell.top_correlations.len() <= 4);
        for c in &cell.top_correlations {
            assert!((0.0..=1.0).contains(&c.strength));
            assert!((0.0..=1.0).contains(&c.quality));
        }
        for pair in cell.top_correlations.windows(2) {
            assert!(pair[0].strength >= pair[1].strength);
        }
    }
}

/// The sweep restores the workers' busy intents afterwards.
#[test]
fn sweep_restores_busy_states() {
    let tester = StressTester::new(3);
    tester.set_busy(0, true);
    tester.set_busy(1, false);
    tester.set_busy(2, true);

    let stats = StatsTable::new(256);
    stats.record(1, &[0.0]);

    let terminate = AtomicBool::new(false);
    let cfg = SweepConfig {
        baseline: Duration::from_millis(5),
        active: Duration::from_millis(10),
        update_interval: Duration::from_millis(2),
    };
    run_sweep(&tester, &stats, &terminate, &cfg);

    assert!(tester.busy_state(0));
    assert!(!tester.busy_state(1));
    assert!(tester.busy_state(2));
}

/// A terminate request aborts the sweep promptly.
#[test]
fn sweep_honors_terminate() {
    let tester = StressTester::new(8);
    let stats = StatsTable::new(256);
    let terminate = AtomicBool::new(true);

    let cfg = SweepConfig {
        baseline: Duration::from_secs(10),
        active: Duration::from_secs(10),
        update_interval: Duration::from_millis(5),
    };

    let start = std::time::Instant::now();
    run_sweep(&tester, &stats, &terminate, &cfg);
    assert!(start.elapsed() < Duration::from_secs(2));
}
