//! Metric sources queried by the sampler.
//!
//! Each source is independent: it owns whatever state it needs between
//! samples and reports a single value or a [`MetricSourceError`]. The
//! sampler never sees a partial reading from a source, only a value or a
//! failure.

use sysinfo::System;
use thiserror::Error;

/// A single metric query failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricSourceError {
    #[error("{source_name} unavailable: {reason}")]
    Unavailable {
        source_name: &'static str,
        reason: String,
    },
    #[error("{source_name} produced a non-finite reading: {value}")]
    InvalidReading { source_name: &'static str, value: f64 },
}

/// A metric that can be sampled on demand.
pub trait MetricSource: Send {
    type Value;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Take one reading.
    fn sample(&mut self) -> Result<Self::Value, MetricSourceError>;
}

/// Validate a percentage reading, clamping finite values into `0..=100`.
pub fn percentage(source_name: &'static str, value: f64) -> Result<f64, MetricSourceError> {
    if !value.is_finite() {
        return Err(MetricSourceError::InvalidReading { source_name, value });
    }
    Ok(value.clamp(0.0, 100.0))
}

/// Global CPU utilization from `sysinfo`.
///
/// CPU usage is a delta between two refreshes, so construction performs a
/// baseline refresh. If the next sample follows too closely the reported
/// value may be zero.
pub struct CpuLoadSource {
    sys: System,
}

impl CpuLoadSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Baseline refresh so the next call gets a real CPU delta.
        sys.refresh_cpu_usage();
        Self { sys }
    }
}

impl Default for CpuLoadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for CpuLoadSource {
    type Value = f64;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn sample(&mut self) -> Result<f64, MetricSourceError> {
        self.sys.refresh_cpu_usage();
        if self.sys.cpus().is_empty() {
            return Err(MetricSourceError::Unavailable {
                source_name: self.name(),
                reason: "no CPUs reported".into(),
            });
        }
        percentage(self.name(), f64::from(self.sys.global_cpu_usage()))
    }
}

/// Physical memory utilization from `sysinfo`.
pub struct MemoryLoadSource {
    sys: System,
}

impl MemoryLoadSource {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl Default for MemoryLoadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for MemoryLoadSource {
    type Value = f64;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn sample(&mut self) -> Result<f64, MetricSourceError> {
        self.sys.refresh_memory();
        used_percent(self.name(), self.sys.used_memory(), self.sys.total_memory())
    }
}

fn used_percent(source_name: &'static str, used: u64, total: u64) -> Result<f64, MetricSourceError> {
    if total == 0 {
        return Err(MetricSourceError::Unavailable {
            source_name,
            reason: "total memory reported as zero".into(),
        });
    }
    percentage(source_name, used as f64 / total as f64 * 100.0)
}

/// Count of tasks alive on the current tokio runtime.
#[derive(Debug, Default)]
pub struct ActiveTaskSource;

impl ActiveTaskSource {
    pub fn new() -> Self {
        Self
    }
}

impl MetricSource for ActiveTaskSource {
    type Value = u64;

    fn name(&self) -> &'static str {
        "tasks"
    }

    fn sample(&mut self) -> Result<u64, MetricSourceError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|err| {
            MetricSourceError::Unavailable {
                source_name: self.name(),
                reason: err.to_string(),
            }
        })?;
        Ok(handle.metrics().num_alive_tasks() as u64)
    }
}
