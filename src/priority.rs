//! Priority levels, the load feedback policy, and the host scheduling
//! capability that applies a level to the calling thread.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::thread::ThreadId;

use serde::{Deserialize, Serialize};

use crate::error::PriorityError;
use crate::probe::UtilizationSample;

/// A thread scheduling priority expressed as a nice value.
///
/// Numerically smaller means more CPU share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityLevel(pub i32);

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive range of legal levels, `highest` being numerically smallest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    highest: PriorityLevel,
    lowest: PriorityLevel,
}

impl PriorityRange {
    pub fn new(highest: PriorityLevel, lowest: PriorityLevel) -> Self {
        Self { highest, lowest }
    }

    pub fn highest(&self) -> PriorityLevel {
        self.highest
    }

    pub fn lowest(&self) -> PriorityLevel {
        self.lowest
    }

    pub fn contains(&self, level: PriorityLevel) -> bool {
        level >= self.highest && level <= self.lowest
    }

    /// Pull `level` back inside the range.
    pub fn clamp(&self, level: PriorityLevel) -> PriorityLevel {
        if level < self.highest {
            self.highest
        } else if level > self.lowest {
            self.lowest
        } else {
            level
        }
    }

    /// One step toward `highest`, saturating.
    pub fn raise(&self, level: PriorityLevel) -> PriorityLevel {
        self.clamp(PriorityLevel(level.0.saturating_sub(1)))
    }

    /// One step toward `lowest`, saturating.
    pub fn lower(&self, level: PriorityLevel) -> PriorityLevel {
        self.clamp(PriorityLevel(level.0.saturating_add(1)))
    }
}

/// Which way the worker moves when the host load leaves the dead band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackDirection {
    /// Idle host: step toward lowest. Busy host: step toward highest so the
    /// worker keeps its share under contention.
    YieldWhenIdle,
    /// Busy host: step toward lowest. Idle host: step toward highest.
    YieldWhenBusy,
}

impl fmt::Display for FeedbackDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::YieldWhenIdle => "yield-when-idle",
            Self::YieldWhenBusy => "yield-when-busy",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FeedbackDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yield-when-idle" => Ok(Self::YieldWhenIdle),
            "yield-when-busy" => Ok(Self::YieldWhenBusy),
            other => Err(format!("unknown feedback direction: {other}")),
        }
    }
}

/// Maps one utilization sample to the next priority level.
#[derive(Debug, Clone, Copy)]
pub struct PriorityPolicy {
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub range: PriorityRange,
    pub direction: FeedbackDirection,
}

impl PriorityPolicy {
    pub fn new(
        low_threshold: f64,
        high_threshold: f64,
        range: PriorityRange,
        direction: FeedbackDirection,
    ) -> Self {
        Self {
            low_threshold,
            high_threshold,
            range,
            direction,
        }
    }

    /// Compute the next level. Moves at most one step and never leaves the
    /// range. Samples covering no elapsed time carry no load information and
    /// leave the level where it is.
    pub fn next(&self, sample: &UtilizationSample, current: PriorityLevel) -> PriorityLevel {
        let current = self.range.clamp(current);
        if sample.total_time_delta == 0 {
            return current;
        }

        let percent = sample.derived_percent;
        match self.direction {
            FeedbackDirection::YieldWhenIdle if percent < self.low_threshold => {
                self.range.lower(current)
            }
            FeedbackDirection::YieldWhenIdle if percent > self.high_threshold => {
                self.range.raise(current)
            }
            FeedbackDirection::YieldWhenBusy if percent < self.low_threshold => {
                self.range.raise(current)
            }
            FeedbackDirection::YieldWhenBusy if percent > self.high_threshold => {
                self.range.lower(current)
            }
            _ => current,
        }
    }
}

/// Host capability for reading and setting the calling thread's priority.
///
/// Both priority methods act on the thread that calls them; there is no way
/// to set another thread's priority through this trait.
pub trait ThreadScheduler: Send + Sync {
    /// OS identifier of the calling thread.
    fn current_thread_id(&self) -> i32;

    fn get_own_priority(&self) -> Result<PriorityLevel, PriorityError>;

    fn set_own_priority(&self, level: PriorityLevel) -> Result<(), PriorityError>;
}

/// Linux nice-value scheduler (`setpriority(PRIO_PROCESS, gettid(), ..)`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NiceScheduler;

#[cfg(target_os = "linux")]
impl ThreadScheduler for NiceScheduler {
    fn current_thread_id(&self) -> i32 {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::gettid() }
    }

    fn get_own_priority(&self) -> Result<PriorityLevel, PriorityError> {
        let tid = self.current_thread_id();
        // getpriority can legitimately return -1, so errno is the only
        // reliable failure signal.
        // SAFETY: __errno_location returns this thread's errno slot.
        unsafe { *libc::__errno_location() = 0 };
        // SAFETY: plain syscall on our own tid.
        let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
        let err = std::io::Error::last_os_error();
        if value == -1 && err.raw_os_error().unwrap_or(0) != 0 {
            return Err(PriorityError::Query { tid, source: err });
        }
        Ok(PriorityLevel(value))
    }

    fn set_own_priority(&self, level: PriorityLevel) -> Result<(), PriorityError> {
        let tid = self.current_thread_id();
        // SAFETY: plain syscall on our own tid.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, level.0) };
        if rc != 0 {
            return Err(PriorityError::Refused {
                tid,
                level: level.0,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl ThreadScheduler for NiceScheduler {
    fn current_thread_id(&self) -> i32 {
        std::process::id() as i32
    }

    fn get_own_priority(&self) -> Result<PriorityLevel, PriorityError> {
        Err(PriorityError::Query {
            tid: self.current_thread_id(),
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }

    fn set_own_priority(&self, level: PriorityLevel) -> Result<(), PriorityError> {
        Err(PriorityError::Refused {
            tid: self.current_thread_id(),
            level: level.0,
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }
}

/// One `set_own_priority` call seen by a [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityApplication {
    pub thread: ThreadId,
    pub level: PriorityLevel,
    pub accepted: bool,
}

#[derive(Debug)]
struct RecordingState {
    current: PriorityLevel,
    refuse: bool,
    applications: Vec<PriorityApplication>,
}

/// In-memory scheduler for hosts without nice control, and for tests.
///
/// Records which thread asked for which level; can be told to refuse.
#[derive(Debug)]
pub struct RecordingScheduler {
    state: Mutex<RecordingState>,
}

impl RecordingScheduler {
    pub fn new(initial: PriorityLevel) -> Self {
        Self {
            state: Mutex::new(RecordingState {
                current: initial,
                refuse: false,
                applications: Vec::new(),
            }),
        }
    }

    /// Make subsequent `set_own_priority` calls fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse = refuse;
        }
    }

    pub fn applications(&self) -> Vec<PriorityApplication> {
        self.state
            .lock()
            .map(|s| s.applications.clone())
            .unwrap_or_default()
    }

    pub fn current(&self) -> PriorityLevel {
        self.state
            .lock()
            .map(|s| s.current)
            .unwrap_or(PriorityLevel(0))
    }
}

impl ThreadScheduler for RecordingScheduler {
    fn current_thread_id(&self) -> i32 {
        NiceScheduler.current_thread_id()
    }

    fn get_own_priority(&self) -> Result<PriorityLevel, PriorityError> {
        Ok(self.current())
    }

    fn set_own_priority(&self, level: PriorityLevel) -> Result<(), PriorityError> {
        let tid = self.current_thread_id();
        let mut state = self.state.lock().map_err(|_| PriorityError::Refused {
            tid,
            level: level.0,
            source: std::io::Error::other("scheduler state poisoned"),
        })?;
        let accepted = !state.refuse;
        state.applications.push(PriorityApplication {
            thread: std::thread::current().id(),
            level,
            accepted,
        });
        if !accepted {
            return Err(PriorityError::Refused {
                tid,
                level: level.0,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        state.current = level;
        Ok(())
    }
}
