pub mod report;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::stats::StatsTable;
use crate::stimulus::StressTester;

/// Timing of one sequential per-core sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Idle window measured before each core is stressed.
    pub baseline: Duration,
    /// Stressed window per core.
    pub active: Duration,
    /// How often strengths are recomputed during the active window.
    pub update_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            baseline: Duration::from_millis(1500),
            active: Duration::from_secs(2),
            update_interval: Duration::from_millis(1000 / 60),
        }
    }
}

/// Sleep in update-interval slices so shutdown stays responsive.
fn sleep_checked(total: Duration, slice: Duration, terminate: &AtomicBool) {
    let start = Instant::now();
    while start.elapsed() < total {
        if terminate.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(slice.min(total.saturating_sub(start.elapsed())));
    }
}

/// Sequential baseline/active variance sweep.
///
/// For each core in turn: hold every stress worker idle, accumulate a
/// baseline window and snapshot per-sensor stddevs; then stress only that
/// core and periodically recompute
/// `strength = sqrt(max(0, (active - baseline) / (active + baseline + eps)))`
/// against the still-accumulating window, updating the ranked attributions
/// live. Results are cumulative across cores within a run and cleared
/// between runs. The workers' previous busy intents are restored at the
/// end.
pub fn run_sweep(
    tester: &StressTester,
    stats: &StatsTable,
    terminate: &AtomicBool,
    cfg: &SweepConfig,
) {
    info!("starting correlation sweep");
    stats.clear_correlations();

    let cores = tester.core_count();
    let previous: Vec<bool> = (0..cores).map(|c| tester.busy_state(c)).collect();
    for core in 0..cores {
        tester.set_busy(core, false);
    }

    for core in 0..cores {
        if terminate.load(Ordering::Relaxed) {
            break;
        }
        info!(core, "measuring core");

        // Baseline: everything idle.
        stats.clear_histories();
        sleep_checked(cfg.baseline, cfg.update_interval, terminate);
        let baseline = stats.history_stddevs();

        // Active: only this core stressed; recompute as data accumulates.
        tester.set_busy(core, true);
        stats.clear_histories();

        let start = Instant::now();
        while start.elapsed() < cfg.active && !terminate.load(Ordering::Relaxed) {
            std::thread::sleep(cfg.update_interval);

            let active = stats.history_stddevs();
            for (sensor, (&a, &b)) in active.iter().zip(baseline.iter()).enumerate() {
                let denom = a + b + 1e-9;
                let strength = ((a - b) / denom).max(0.0).sqrt();
                stats.update_correlation(sensor, core as i32, strength, 1.0);
            }
        }

        tester.set_busy(core, false);
        info!(core, "finished measurement");
    }

    for (core, &busy) in previous.iter().enumerate() {
        tester.set_busy(core, busy);
    }
    info!("correlation sweep complete");
}

/// On-phase vs. off-phase mean comparison against the known square-wave
/// schedule.
///
/// Each history sample is classified by its position inside core `c`'s
/// period: the first third is ON, the rest OFF. The absolute mean
/// difference, normalized by the sensor's observed dynamic range, is the
/// strength; quality combines how far the best core separates from the
/// runner-up with how many samples landed in the smaller phase set.
pub fn phase_mean_correlation(tester: &StressTester, stats: &StatsTable) {
    let start_ns = tester.start_time_ns();
    let periods = tester.periods_ms();
    let cells = stats.snapshot();

    info!(sensors = cells.len(), "running phase-mean correlation");

    for (sensor, cell) in cells.iter().enumerate() {
        if cell.history.is_empty() {
            continue;
        }

        let range = cell.max - cell.min;

        // Mean difference per core, with the phase-set sizes for the
        // confidence factor. None when either set is empty.
        let diffs: Vec<Option<(f32, usize, usize)>> = periods
            .iter()
            .map(|&period_ms| {
                let period_ns = period_ms * 1_000_000;
                let work_ns = period_ns / 3;

                let (mut on_sum, mut on_n) = (0.0f64, 0usize);
                let (mut off_sum, mut off_n) = (0.0f64, 0usize);

                for &(ts, value) in &cell.history {
                    if ts < start_ns {
                        continue;
                    }
                    if (ts - start_ns) % period_ns < work_ns {
                        on_sum += f64::from(value);
                        on_n += 1;
                    } else {
                        off_sum += f64::from(value);
                        off_n += 1;
                    }
                }

                if on_n == 0 || off_n == 0 {
                    return None;
                }
                let diff = (on_sum / on_n as f64 - off_sum / off_n as f64).abs() as f32;
                Some((diff, on_n, off_n))
            })
            .collect();

        let mut best = 0.0f32;
        let mut second = 0.0f32;
        for &(diff, _, _) in diffs.iter().flatten() {
            if diff > best {
                second = best;
                best = diff;
            } else if diff > second {
                second = diff;
            }
        }
        let separation = if best > 0.0 {
            (1.0 - second / best).clamp(0.0, 1.0)
        } else {
            0.0
        };

        for (core, entry) in diffs.iter().enumerate() {
            let Some((diff, on_n, off_n)) = *entry else {
                continue;
            };

            let strength = if range < 1e-9 {
                0.0
            } else {
                (diff / range).min(1.0)
            };
            let confidence = (on_n.min(off_n) as f32 / 30.0).min(1.0);

            stats.update_correlation(sensor, core as i32, strength, separation * confidence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_checked_honors_terminate() {
        let terminate = AtomicBool::new(true);
        let start = Instant::now();
        sleep_checked(
            Duration::from_secs(10),
            Duration::from_millis(5),
            &terminate,
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_phase_mean_recovers_square_wave() {
        // Core 1 of a two-core tester; its period is 26 ms. Build a
        // sensor that is exactly 1.0 during core 1's ON third and 0.0
        // otherwise, sampled at 1 ms for 2 s.
        let tester = StressTester::new(2);
        let stats = StatsTable::new(4096);
        let period_ns = tester.periods_ms()[1] * 1_000_000;
        let work_ns = period_ns / 3;

        // start_time_ns is 0 when the tester never started; generate
        // timestamps from 0 so the modulo classification lines up.
        for ms in 0..2_000u64 {
            let ts = ms * 1_000_000;
            let on = ts % period_ns < work_ns;
            stats.record(ts, &[f32::from(u8::from(on)), 0.5]);
        }

        phase_mean_correlation(&tester, &stats);

        let cells = stats.snapshot();
        let top = cells[0].top_correlations.first().expect("attribution");
        assert_eq!(top.core_id, 1);
        assert!(top.strength >= 0.9, "strength {} too weak", top.strength);
        assert!(top.quality > 0.0);

        // Every recorded entry stays inside the [0, 1] bounds.
        for cell in &cells {
            for c in &cell.top_correlations {
                assert!((0.0..=1.0).contains(&c.strength));
                assert!((0.0..=1.0).contains(&c.quality));
            }
            for pair in cell.top_correlations.windows(2) {
                assert!(pair[0].strength >= pair[1].strength);
            }
        }
    }

    #[test]
    fn test_phase_mean_skips_flat_history() {
        let tester = StressTester::new(2);
        let stats = StatsTable::new(256);
        for ms in 0..100u64 {
            stats.record(ms * 1_000_000, &[5.0]);
        }

        phase_mean_correlation(&tester, &stats);

        // Range is zero, so strength collapses to zero but stays bounded.
        for c in &stats.snapshot()[0].top_correlations {
            assert_eq!(c.strength, 0.0);
        }
    }
}
