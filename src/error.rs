use std::io;
use thiserror::Error;

/// Construction-time failures of the telemetry surface.
///
/// Runtime anomalies (late periods, under-reads, lock denials) are handled
/// locally and logged; only these conditions surface to the caller.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("pm_table not present at {0}")]
    Missing(String),

    #[error("pm_table size {0} bytes fails sanity bounds (0 < size <= 16384)")]
    SizeSanity(u64),

    #[error("pm_table size {0} bytes is not a multiple of 4")]
    Misaligned(u64),

    #[error("short read from pm_table: expected {expected} bytes, got {got}")]
    UnderRead { expected: usize, got: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TableError>;
