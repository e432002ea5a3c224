use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::stats::{CellStats, MAX_TOP_CORRELATIONS};

/// Resolve a display name for a sensor index.
pub type SensorNamer<'a> = &'a dyn Fn(usize) -> String;

/// Quote a CSV field only when it needs it.
fn csv_field(name: &str) -> Cow<'_, str> {
    if name.contains(',') {
        Cow::Owned(format!("\"{name}\""))
    } else {
        Cow::Borrowed(name)
    }
}

/// Write the per-sensor correlation table and the strength summary.
///
/// Two files per run, both with the run timestamp in the name:
/// `<prefix>_table_<ts>.csv` has one row per sensor with its live value,
/// lifetime statistics and top-4 attributions; `<prefix>_summary_<ts>.csv`
/// aggregates min/max/mean/median over every recorded strength. Returns
/// both paths.
pub fn write_reports(
    dir: &Path,
    prefix: &str,
    cells: &[CellStats],
    namer: Option<SensorNamer<'_>>,
) -> Result<(PathBuf, PathBuf)> {
    if cells.is_empty() {
        warn!("no analysis results to save");
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let table_path = dir.join(format!("{prefix}_table_{stamp}.csv"));
    let summary_path = dir.join(format!("{prefix}_summary_{stamp}.csv"));

    write_table(&table_path, cells, namer)
        .with_context(|| format!("writing correlation table {}", table_path.display()))?;
    info!(path = %table_path.display(), "correlation table saved");

    let strengths: Vec<f32> = cells
        .iter()
        .flat_map(|c| c.top_correlations.iter().map(|t| t.strength))
        .collect();

    write_summary(&summary_path, &strengths)
        .with_context(|| format!("writing correlation summary {}", summary_path.display()))?;
    info!(path = %summary_path.display(), "correlation summary saved");

    Ok((table_path, summary_path))
}

fn write_table(path: &Path, cells: &[CellStats], namer: Option<SensorNamer<'_>>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    write!(out, "index,name,live,min,max,mean,stddev")?;
    for i in 1..=MAX_TOP_CORRELATIONS {
        write!(out, ",top{i}_core,top{i}_strength,top{i}_quality")?;
    }
    writeln!(out)?;

    for (index, cell) in cells.iter().enumerate() {
        let name = namer.map(|f| f(index)).unwrap_or_default();
        // A cell that never saw a sample still has sentinel extremes.
        let (min, max) = if cell.count() == 0 {
            (0.0, 0.0)
        } else {
            (cell.min, cell.max)
        };

        write!(
            out,
            "{index},{},{:.3},{min:.3},{max:.3},{:.3},{:.3}",
            csv_field(&name),
            cell.current,
            cell.mean(),
            cell.stddev(),
        )?;

        for slot in 0..MAX_TOP_CORRELATIONS {
            match cell.top_correlations.get(slot) {
                Some(c) => write!(
                    out,
                    ",{},{:.3},{:.3}",
                    c.core_id, c.strength, c.quality
                )?,
                None => write!(out, ",N/A,N/A,N/A")?,
            }
        }
        writeln!(out)?;
    }

    out.flush()?;
    Ok(())
}

fn write_summary(path: &Path, strengths: &[f32]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);

    if strengths.is_empty() {
        writeln!(out, "no correlation strengths recorded")?;
        out.flush()?;
        return Ok(());
    }

    let mut sorted = strengths.to_vec();
    sorted.sort_by(f32::total_cmp);

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = sorted.iter().map(|&s| f64::from(s)).sum::<f64>() / sorted.len() as f64;

    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    writeln!(out, "statistic,value")?;
    writeln!(out, "min_strength,{min:.3}")?;
    writeln!(out, "max_strength,{max:.3}")?;
    writeln!(out, "mean_strength,{mean:.3}")?;
    writeln!(out, "median_strength,{median:.3}")?;

    out.flush()?;
    Ok(())
}
