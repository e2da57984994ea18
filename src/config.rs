//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::priority::{FeedbackDirection, PriorityLevel, PriorityRange};

/// Keeper configuration, built from `KEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Address the control surface listens on.
    pub control_addr: SocketAddr,
    /// Period of the utilization probe / priority policy cycle.
    pub probe_interval: Duration,
    /// Period of the restart-guarantee wake.
    pub respawn_interval: Duration,
    /// Policy thresholds, in percent.
    pub low_threshold: f64,
    pub high_threshold: f64,
    /// Legal priority range for the worker thread (nice values).
    pub priority_range: PriorityRange,
    /// Priority the worker starts at.
    pub initial_priority: PriorityLevel,
    pub feedback: FeedbackDirection,
    /// Dimension of the matrix workload.
    pub matrix_size: usize,
    /// Holds the respawn registration and the log files.
    pub state_dir: PathBuf,
    /// Source of the aggregate CPU counters.
    pub proc_stat_path: PathBuf,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            probe_interval: Duration::from_secs(10),
            respawn_interval: Duration::from_secs(60), // 1 minute
            low_threshold: 30.0,
            high_threshold: 50.0,
            priority_range: PriorityRange::new(PriorityLevel(-2), PriorityLevel(19)),
            initial_priority: PriorityLevel(0),
            feedback: FeedbackDirection::YieldWhenIdle,
            matrix_size: 200,
            state_dir: PathBuf::from(".worker-keeper"),
            proc_stat_path: PathBuf::from("/proc/stat"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl KeeperConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let state_dir = std::env::var("KEEPER_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".worker-keeper")
            });

        let feedback = std::env::var("KEEPER_FEEDBACK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.feedback);

        let highest = env_parse("KEEPER_PRIORITY_HIGHEST", defaults.priority_range.highest().0);
        let lowest = env_parse("KEEPER_PRIORITY_LOWEST", defaults.priority_range.lowest().0);

        Self {
            control_addr: env_parse("KEEPER_CONTROL_ADDR", defaults.control_addr),
            probe_interval: Duration::from_secs(env_parse("KEEPER_PROBE_INTERVAL_SECS", 10)),
            respawn_interval: Duration::from_secs(env_parse("KEEPER_RESPAWN_INTERVAL_SECS", 60)),
            low_threshold: env_parse("KEEPER_LOW_THRESHOLD", defaults.low_threshold),
            high_threshold: env_parse("KEEPER_HIGH_THRESHOLD", defaults.high_threshold),
            priority_range: PriorityRange::new(PriorityLevel(highest), PriorityLevel(lowest)),
            initial_priority: PriorityLevel(env_parse(
                "KEEPER_PRIORITY_INITIAL",
                defaults.initial_priority.0,
            )),
            feedback,
            matrix_size: env_parse("KEEPER_MATRIX_SIZE", defaults.matrix_size),
            state_dir,
            proc_stat_path: std::env::var("KEEPER_PROC_STAT")
                .map(PathBuf::from)
                .unwrap_or(defaults.proc_stat_path),
        }
    }

    /// Reject combinations the control loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.low_threshold)
            || !(0.0..=100.0).contains(&self.high_threshold)
            || self.low_threshold > self.high_threshold
        {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_LOW_THRESHOLD/KEEPER_HIGH_THRESHOLD".to_string(),
                message: format!(
                    "need 0 <= low <= high <= 100, got low={} high={}",
                    self.low_threshold, self.high_threshold
                ),
            });
        }
        if self.priority_range.highest() > self.priority_range.lowest() {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_PRIORITY_HIGHEST".to_string(),
                message: format!(
                    "highest ({}) must not be numerically above lowest ({})",
                    self.priority_range.highest(),
                    self.priority_range.lowest()
                ),
            });
        }
        if !self.priority_range.contains(self.initial_priority) {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_PRIORITY_INITIAL".to_string(),
                message: format!(
                    "{} is outside [{}, {}]",
                    self.initial_priority,
                    self.priority_range.highest(),
                    self.priority_range.lowest()
                ),
            });
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_PROBE_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.respawn_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_RESPAWN_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.matrix_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "KEEPER_MATRIX_SIZE".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Directory the rolling log files are written to.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}
