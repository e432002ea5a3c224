use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::error::{Result, TableError};

/// Default sysfs paths exported by the ryzen_smu kernel driver.
pub const DEFAULT_TABLE_PATH: &str = "/sys/kernel/ryzen_smu_drv/pm_table";
pub const DEFAULT_SIZE_PATH: &str = "/sys/kernel/ryzen_smu_drv/pm_table_size";

/// Largest pm_table the driver is known to export.
pub const MAX_TABLE_BYTES: u64 = 16384;

/// Reader for the kernel-exported pm_table sensor blob.
///
/// The blob is a fixed-size little-endian array of IEEE-754 f32 sensor
/// values; its size is declared by a sibling file holding a little-endian
/// u64 byte count. Size discovery happens once at open; `read` fills the
/// caller's buffer from offset 0 and rewinds, with no allocation, so it is
/// safe to call from the sampler thread.
#[derive(Debug)]
pub struct PmTableReader {
    file: File,
    size: usize,
}

impl PmTableReader {
    /// Open the pm_table, discovering and sanity-checking its size.
    pub fn open(table_path: &Path, size_path: &Path) -> Result<Self> {
        let size = read_le_u64(size_path)?;

        if size == 0 || size > MAX_TABLE_BYTES {
            return Err(TableError::SizeSanity(size));
        }
        if size % 4 != 0 {
            return Err(TableError::Misaligned(size));
        }

        let file = File::open(table_path)
            .map_err(|_| TableError::Missing(table_path.display().to_string()))?;

        info!(size, path = %table_path.display(), "detected pm_table");

        Ok(Self {
            file,
            size: size as usize,
        })
    }

    /// Blob length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of f32 sensor slots in the blob.
    pub fn num_sensors(&self) -> usize {
        self.size / 4
    }

    /// Fill `dst[..size]` with the current snapshot and rewind for the
    /// next call. Fails with `UnderRead` when the kernel returns fewer
    /// bytes than the declared size.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        let dst = &mut dst[..self.size];

        let mut got = 0;
        while got < self.size {
            let n = self.file.read(&mut dst[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }

        self.file.seek(SeekFrom::Start(0))?;

        if got != self.size {
            return Err(TableError::UnderRead {
                expected: self.size,
                got,
            });
        }

        Ok(())
    }
}

/// Read a little-endian u64 from a binary sysfs file.
fn read_le_u64(path: &Path) -> Result<u64> {
    let mut file =
        File::open(path).map_err(|_| TableError::Missing(path.display().to_string()))?;

    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;

    Ok(u64::from_le_bytes(buf))
}
