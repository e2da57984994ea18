//! Utilization probe: turns monotonically increasing CPU counters into a
//! busy percentage per cycle.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ProbeError;

/// Cumulative busy+idle and idle time, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuCounters {
    pub total: u64,
    pub idle: u64,
}

/// Anything that can report cumulative CPU counters.
pub trait CpuCounterSource: Send {
    fn read(&mut self) -> Result<CpuCounters, ProbeError>;
}

impl CpuCounterSource for Box<dyn CpuCounterSource> {
    fn read(&mut self) -> Result<CpuCounters, ProbeError> {
        (**self).read()
    }
}

/// Reads the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone)]
pub struct ProcStatSource {
    path: PathBuf,
}

impl ProcStatSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcStatSource {
    fn default() -> Self {
        Self::new("/proc/stat")
    }
}

impl CpuCounterSource for ProcStatSource {
    fn read(&mut self) -> Result<CpuCounters, ProbeError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ProbeError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        parse_proc_stat(&content)
    }
}

/// Parse the aggregate line: `cpu user nice system idle iowait irq softirq steal ...`.
///
/// Total sums the first eight fields; idle counts `idle` and `iowait`.
pub fn parse_proc_stat(content: &str) -> Result<CpuCounters, ProbeError> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| ProbeError::Malformed("no aggregate cpu line".to_string()))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProbeError::Malformed(format!("{line}: {e}")))?;

    if fields.len() < 4 {
        return Err(ProbeError::Malformed(format!(
            "expected at least 4 counters, got {}",
            fields.len()
        )));
    }

    // guest and guest_nice are already included in user and nice
    let counted = fields.len().min(8);
    let total = fields[..counted].iter().fold(0u64, |acc, f| acc.saturating_add(*f));
    let idle = fields[3].saturating_add(fields.get(4).copied().unwrap_or(0));
    Ok(CpuCounters { total, idle })
}

/// One probe cycle's measurement. Not retained after the policy consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub total_time_delta: u64,
    pub idle_time_delta: u64,
    pub derived_percent: f64,
}

impl UtilizationSample {
    /// A sample that covers no elapsed time.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            total_time_delta: 0,
            idle_time_delta: 0,
            derived_percent: 0.0,
        }
    }

    fn from_deltas(timestamp: DateTime<Utc>, total: u64, idle: u64) -> Self {
        if total == 0 {
            return Self::empty(timestamp);
        }
        let percent = 100.0 * (1.0 - idle as f64 / total as f64);
        Self {
            timestamp,
            total_time_delta: total,
            idle_time_delta: idle,
            derived_percent: percent.clamp(0.0, 100.0),
        }
    }
}

/// Samples system CPU load against the previous reading.
///
/// Owned by a single scheduling context; it does not schedule itself.
pub struct UtilizationProbe<S: CpuCounterSource = ProcStatSource> {
    source: S,
    previous: Option<CpuCounters>,
}

impl<S: CpuCounterSource> UtilizationProbe<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            previous: None,
        }
    }

    /// Take one sample.
    ///
    /// The first call only establishes the baseline and reports 0%. A failed
    /// read reports a zero-delta sample and keeps the old baseline.
    pub fn sample_once(&mut self) -> UtilizationSample {
        let now = Utc::now();
        let current = match self.source.read() {
            Ok(counters) => counters,
            Err(e) => {
                tracing::warn!(error = %e, "CPU counter read failed, treating as idle cycle");
                return UtilizationSample::empty(now);
            }
        };

        let Some(previous) = self.previous.replace(current) else {
            return UtilizationSample::empty(now);
        };

        // counters can go backwards across a CPU hotplug; treat as no data
        let total = current.total.saturating_sub(previous.total);
        let idle = current.idle.saturating_sub(previous.idle).min(total);
        UtilizationSample::from_deltas(now, total, idle)
    }
}

/// Current frequency of every online core in MHz, 0.0 where unreadable.
pub fn read_core_frequencies() -> Vec<f64> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..cores)
        .map(|core| {
            let path = format!("/sys/devices/system/cpu/cpu{core}/cpufreq/scaling_cur_freq");
            std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|khz| khz / 1000.0)
                .unwrap_or(0.0)
        })
        .collect()
}

pub const CPU_INFO_PATH: &str = "/proc/cpuinfo";

/// Host CPU description: the key/value pairs of the first processor block in
/// a cpuinfo file, followed by the number of processor blocks.
pub fn read_cpu_info(path: impl AsRef<Path>) -> Result<Vec<(String, String)>, ProbeError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ProbeError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut entries = Vec::new();
    let mut processors = 0usize;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key == "processor" {
            processors += 1;
        }
        if processors <= 1 {
            entries.push((key.to_string(), value.trim().to_string()));
        }
    }
    entries.push(("processors".to_string(), processors.to_string()));
    Ok(entries)
}
