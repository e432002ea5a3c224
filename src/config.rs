use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::correlate::SweepConfig;
use crate::eye::EyeConfig;
use crate::stimulus::BurstParams;
use crate::table;

/// Top-level configuration for the smuscope pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Telemetry surface paths.
    #[serde(default)]
    pub table: TableConfig,

    /// Sampler placement and transport sizing.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Eye-diagram window geometry.
    #[serde(default)]
    pub eye: EyeWindowConfig,

    /// Mode-A stimulus parameters.
    #[serde(default)]
    pub stimulus: StimulusConfig,

    /// Correlation sweep timing and reporting.
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Interesting-sensor preflight parameters.
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Paths of the kernel-exported sensor blob and its size sibling.
#[derive(Debug, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_table_path")]
    pub table_path: String,

    #[serde(default = "default_size_path")]
    pub size_path: String,
}

/// Sampler placement and transport sizing.
#[derive(Debug, Deserialize)]
pub struct SamplingConfig {
    /// Core the sampler is pinned to. Default: 0.
    #[serde(default)]
    pub measurement_core: i32,

    /// SCHED_FIFO priority of the sampler. Default: 98.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// SPSC ring capacity in samples. Default: 600 (~0.6 s of backlog).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Samples per aggregated jitter report. Default: 10000.
    #[serde(default = "default_jitter_report_interval")]
    pub jitter_report_interval: usize,

    /// Jitter histogram half-range in microseconds. Default: 100.
    #[serde(default = "default_jitter_histogram_range")]
    pub jitter_histogram_range_us: i64,
}

/// Eye-diagram window geometry.
#[derive(Debug, Deserialize)]
pub struct EyeWindowConfig {
    /// Pre-trigger window in ms. Default: 50.
    #[serde(default = "default_window_before")]
    pub window_before_ms: u32,

    /// Post-trigger window in ms. Default: 150.
    #[serde(default = "default_window_after")]
    pub window_after_ms: u32,

    /// Per-bin accumulation cap. Default: 30.
    #[serde(default = "default_max_accumulations")]
    pub max_accumulations: usize,

    /// Trimmed-mean tail percentage. Default: 10.
    #[serde(default = "default_trim_percent")]
    pub trim_percent: f32,
}

/// Mode-A stimulus parameters.
#[derive(Debug, Deserialize)]
pub struct StimulusConfig {
    /// Burst period in ms. Default: 150.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Busy fraction of each period in percent (10..=90). Default: 50.
    #[serde(default = "default_duty_percent")]
    pub duty_percent: u32,

    /// Busy/idle cycles per burst. Default: 30.
    #[serde(default = "default_cycles")]
    pub cycles: u32,
}

/// Correlation sweep timing and reporting.
#[derive(Debug, Deserialize)]
pub struct CorrelationConfig {
    /// Idle window before each core measurement. Default: 1.5s.
    #[serde(default = "default_baseline", with = "humantime_serde")]
    pub baseline: Duration,

    /// Stressed window per core. Default: 2s.
    #[serde(default = "default_active", with = "humantime_serde")]
    pub active: Duration,

    /// Strength recomputation interval. Default: ~16ms (60 Hz).
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Per-sensor history window in samples. Default: 4096.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    /// Directory the CSV reports are written to. Default: ".".
    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    /// Filename prefix of the CSV reports. Default: "correlation".
    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,
}

/// Interesting-sensor preflight parameters.
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    /// Samples taken by the variance probe. Default: 997.
    #[serde(default = "default_probe_samples")]
    pub samples: usize,

    /// Variance above which a sensor counts as moving. Default: 1e-9.
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_table_path() -> String {
    table::DEFAULT_TABLE_PATH.to_string()
}

fn default_size_path() -> String {
    table::DEFAULT_SIZE_PATH.to_string()
}

fn default_priority() -> i32 {
    98
}

fn default_ring_capacity() -> usize {
    600
}

fn default_jitter_report_interval() -> usize {
    10_000
}

fn default_jitter_histogram_range() -> i64 {
    100
}

fn default_window_before() -> u32 {
    50
}

fn default_window_after() -> u32 {
    150
}

fn default_max_accumulations() -> usize {
    30
}

fn default_trim_percent() -> f32 {
    10.0
}

fn default_period_ms() -> u64 {
    150
}

fn default_duty_percent() -> u32 {
    50
}

fn default_cycles() -> u32 {
    30
}

fn default_baseline() -> Duration {
    Duration::from_millis(1500)
}

fn default_active() -> Duration {
    Duration::from_secs(2)
}

fn default_update_interval() -> Duration {
    Duration::from_millis(1000 / 60)
}

fn default_history_depth() -> usize {
    4096
}

fn default_report_dir() -> String {
    ".".to_string()
}

fn default_report_prefix() -> String {
    "correlation".to_string()
}

fn default_probe_samples() -> usize {
    997
}

fn default_variance_threshold() -> f64 {
    1e-9
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            table: TableConfig::default(),
            sampling: SamplingConfig::default(),
            eye: EyeWindowConfig::default(),
            stimulus: StimulusConfig::default(),
            correlation: CorrelationConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            table_path: default_table_path(),
            size_path: default_size_path(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            measurement_core: 0,
            priority: default_priority(),
            ring_capacity: default_ring_capacity(),
            jitter_report_interval: default_jitter_report_interval(),
            jitter_histogram_range_us: default_jitter_histogram_range(),
        }
    }
}

impl Default for EyeWindowConfig {
    fn default() -> Self {
        Self {
            window_before_ms: default_window_before(),
            window_after_ms: default_window_after(),
            max_accumulations: default_max_accumulations(),
            trim_percent: default_trim_percent(),
        }
    }
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            duty_percent: default_duty_percent(),
            cycles: default_cycles(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            active: default_active(),
            update_interval: default_update_interval(),
            history_depth: default_history_depth(),
            report_dir: default_report_dir(),
            report_prefix: default_report_prefix(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            samples: default_probe_samples(),
            variance_threshold: default_variance_threshold(),
        }
    }
}

// --- Validation, loading and view helpers ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate ranges and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sampling.measurement_core < 0 {
            bail!("sampling.measurement_core must be >= 0");
        }

        if self.sampling.ring_capacity < 64 {
            bail!("sampling.ring_capacity must be >= 64");
        }

        if !(1..=99).contains(&self.sampling.priority) {
            bail!("sampling.priority must be in 1..=99");
        }

        if self.eye.window_after_ms < 1 {
            bail!("eye.window_after_ms must be >= 1");
        }

        if self.eye.max_accumulations < 1 {
            bail!("eye.max_accumulations must be >= 1");
        }

        if !(0.0..50.0).contains(&self.eye.trim_percent) {
            bail!("eye.trim_percent must be in [0, 50)");
        }

        if self.stimulus.period_ms < 1 {
            bail!("stimulus.period_ms must be >= 1");
        }

        if !(10..=90).contains(&self.stimulus.duty_percent) {
            bail!("stimulus.duty_percent must be in 10..=90");
        }

        if self.stimulus.cycles < 1 {
            bail!("stimulus.cycles must be >= 1");
        }

        if self.correlation.history_depth < 2 {
            bail!("correlation.history_depth must be >= 2");
        }

        if self.probe.samples < 2 {
            bail!("probe.samples must be >= 2");
        }

        Ok(())
    }

    pub fn eye_config(&self) -> EyeConfig {
        EyeConfig {
            window_before_ms: self.eye.window_before_ms,
            window_after_ms: self.eye.window_after_ms,
            max_accumulations: self.eye.max_accumulations,
            trim_percent: self.eye.trim_percent,
        }
    }

    pub fn burst_params(&self) -> BurstParams {
        BurstParams {
            period_ms: self.stimulus.period_ms,
            duty_percent: self.stimulus.duty_percent,
            cycles: self.stimulus.cycles,
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            baseline: self.correlation.baseline,
            active: self.correlation.active,
            update_interval: self.correlation.update_interval,
        }
    }
}
