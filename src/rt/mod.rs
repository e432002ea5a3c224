pub mod guard;
pub mod locked;

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

/// Point below the deadline at which the hybrid wait switches from the
/// absolute-deadline clock sleep to a relax-hint busy spin.
const SPIN_THRESHOLD_NS: u64 = 200_000;

/// Monotonic clock reading in nanoseconds.
pub fn now_ns() -> u64 {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("CLOCK_MONOTONIC is always readable");
    ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
}

/// Architectural spin hint for polite busy-waiting.
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Hybrid sleep+spin wait until an absolute monotonic deadline.
///
/// Sleeps with `clock_nanosleep(TIMER_ABSTIME)` until 200 us before the
/// deadline, then busy-spins with a relax hint. The spin tail keeps the
/// expected wake jitter in the low-microsecond range; the sleep head keeps
/// the core available to the scheduler for the bulk of the period.
pub fn wait_until(deadline_ns: u64) {
    let now = now_ns();
    if deadline_ns <= now {
        return;
    }

    if deadline_ns - now > SPIN_THRESHOLD_NS {
        let wake = deadline_ns - SPIN_THRESHOLD_NS;
        let ts = TimeSpec::new(
            (wake / 1_000_000_000) as i64,
            (wake % 1_000_000_000) as i64,
        );
        // An early EINTR wake is harmless: the spin tail below absorbs it.
        let _ = clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &ts,
        );
    }

    while now_ns() < deadline_ns {
        cpu_relax();
    }
}
