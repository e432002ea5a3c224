use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Scoped real-time elevation for the calling thread.
///
/// On construction: saves the current scheduling policy, priority and CPU
/// affinity, pins the thread to `core_id` (when >= 0) and elevates it to
/// SCHED_FIFO at `priority`. Optionally locks current and future pages into
/// RAM when the memlock resource limit permits.
///
/// Construction is infallible at the API level: each step that fails is
/// logged and the guard records what it actually changed. `Drop` restores
/// the captured state in reverse order on every exit path, including
/// panics, and is a no-op for an inactive guard.
pub struct RealtimeGuard {
    active: bool,
    locked_memory: bool,
    saved_affinity: Option<CpuSet>,
    old_policy: libc::c_int,
    old_param: libc::sched_param,
}

impl RealtimeGuard {
    /// Pin to `core_id` and elevate to SCHED_FIFO at `priority` (1..=99).
    pub fn new(core_id: i32, priority: i32) -> Self {
        Self::with_memory_lock(core_id, priority, false)
    }

    /// As `new`, additionally locking current and future pages into RAM.
    pub fn with_memory_lock(core_id: i32, priority: i32, lock_memory: bool) -> Self {
        let mut old_policy: libc::c_int = libc::SCHED_OTHER;
        // Safety: pthread_getschedparam writes into the out-params for the
        // calling thread; zeroed sched_param is a valid out buffer.
        let mut old_param: libc::sched_param = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::pthread_getschedparam(libc::pthread_self(), &mut old_policy, &mut old_param)
        };
        if ret != 0 {
            warn!(errno = ret, "pthread_getschedparam failed; restore will use SCHED_OTHER");
        }

        let mut saved_affinity = None;
        if core_id >= 0 {
            match sched_getaffinity(Pid::from_raw(0)) {
                Ok(set) => saved_affinity = Some(set),
                Err(e) => warn!(error = %e, "failed to save current affinity"),
            }

            let mut pin = CpuSet::new();
            match pin.set(core_id as usize) {
                Ok(()) => {
                    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &pin) {
                        warn!(core = core_id, error = %e, "failed to pin thread");
                    }
                }
                Err(e) => warn!(core = core_id, error = %e, "core id out of CpuSet range"),
            }
        }

        let param = libc::sched_param {
            sched_priority: priority,
        };
        let ret = unsafe {
            libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
        };
        if ret != 0 {
            warn!(
                priority,
                errno = ret,
                "SCHED_FIFO elevation denied; continuing best-effort (needs root or CAP_SYS_NICE)",
            );
        }

        let locked_memory = if lock_memory { try_mlockall() } else { false };

        debug!(core = core_id, priority, locked_memory, "realtime guard active");

        Self {
            active: true,
            locked_memory,
            saved_affinity,
            old_policy,
            old_param,
        }
    }

    /// Whether the guard will restore state on drop.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether mlockall succeeded.
    pub fn locked_memory(&self) -> bool {
        self.locked_memory
    }
}

impl Drop for RealtimeGuard {
    // Restoration mirrors construction in reverse: memory lock, then
    // scheduling policy, then affinity.
    fn drop(&mut self) {
        if !self.active {
            return;
        }

        if self.locked_memory && unsafe { libc::munlockall() } != 0 {
            warn!("munlockall failed");
        }

        let ret = unsafe {
            libc::pthread_setschedparam(libc::pthread_self(), self.old_policy, &self.old_param)
        };
        if ret != 0 {
            warn!(errno = ret, "failed to restore thread scheduling");
        }

        if let Some(set) = &self.saved_affinity {
            if let Err(e) = sched_setaffinity(Pid::from_raw(0), set) {
                warn!(error = %e, "failed to restore thread affinity");
            }
        }
    }
}

/// Attempt mlockall, gated on RLIMIT_MEMLOCK to avoid pointless failures.
fn try_mlockall() -> bool {
    // Safety: getrlimit writes into the zeroed out-param.
    let mut rl: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rl) } == 0 && rl.rlim_cur == 0 {
        warn!("RLIMIT_MEMLOCK is 0: skipping mlockall");
        return false;
    }

    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        warn!("mlockall failed; continuing with unlocked pages");
        return false;
    }

    true
}
