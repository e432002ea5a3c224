use memmap2::MmapMut;
use tracing::{debug, warn};

enum Backing {
    Mapped(MmapMut),
    Heap(Box<[u8]>),
}

/// Page-rounded, optionally RAM-locked backing store for sample buffers.
///
/// Attempts a page-aligned anonymous mapping and locks it into RAM when the
/// memlock resource limit permits. On mapping failure the buffer falls back
/// to an unlocked heap allocation; failure to lock is never fatal.
pub struct LockedBuffer {
    backing: Backing,
    len: usize,
    locked: bool,
}

impl LockedBuffer {
    pub fn new(bytes: usize) -> Self {
        if bytes == 0 {
            return Self {
                backing: Backing::Heap(Vec::new().into_boxed_slice()),
                len: 0,
                locked: false,
            };
        }

        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        let rounded = bytes.div_ceil(page) * page;

        match MmapMut::map_anon(rounded) {
            Ok(map) => {
                let locked = try_lock(&map, rounded);
                Self {
                    backing: Backing::Mapped(map),
                    len: rounded,
                    locked,
                }
            }
            Err(e) => {
                warn!(bytes = rounded, error = %e, "anonymous mapping failed, falling back to heap");
                Self {
                    backing: Backing::Heap(vec![0u8; bytes].into_boxed_slice()),
                    len: bytes,
                    locked: false,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => &m[..],
            Backing::Heap(h) => h,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Mapped(m) => &mut m[..],
            Backing::Heap(h) => h,
        }
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if self.locked {
            if let Backing::Mapped(m) = &self.backing {
                if let Err(e) = m.unlock() {
                    warn!(error = %e, "munlock failed");
                }
            }
        }
    }
}

/// Lock the mapping into RAM, gated on RLIMIT_MEMLOCK.
fn try_lock(map: &MmapMut, bytes: usize) -> bool {
    // Safety: getrlimit writes into the zeroed out-param.
    let mut rl: libc::rlimit = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rl) } == 0
        && rl.rlim_cur != libc::RLIM_INFINITY
        && bytes as u64 > rl.rlim_cur
    {
        warn!(
            bytes,
            limit = rl.rlim_cur,
            "mlock request exceeds RLIMIT_MEMLOCK, proceeding without lock",
        );
        return false;
    }

    match map.lock() {
        Ok(()) => {
            debug!(bytes, "mlocked sample buffer");
            true
        }
        Err(e) => {
            warn!(bytes, error = %e, "mlock failed, proceeding without locked memory");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_page_rounded_and_writable() {
        let mut buf = LockedBuffer::new(10);
        assert!(buf.len() >= 10);
        assert_eq!(buf.len() % 4096, 0);

        buf.as_mut_slice()[9] = 0xAB;
        assert_eq!(buf.as_slice()[9], 0xAB);
    }

    #[test]
    fn test_zero_size_buffer() {
        let buf = LockedBuffer::new(0);
        assert!(buf.is_empty());
        assert!(!buf.is_locked());
    }

    #[test]
    fn test_buffer_starts_zeroed() {
        let buf = LockedBuffer::new(4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
