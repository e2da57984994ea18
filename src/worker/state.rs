//! Worker state shared between the worker thread and its controllers.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::priority::PriorityLevel;

/// Phase of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    NotStarted,
    Looping,
    Paused,
    Stopped,
}

impl WorkerPhase {
    fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Looping => 1,
            Self::Paused => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Looping,
            2 => Self::Paused,
            3 => Self::Stopped,
            _ => Self::NotStarted,
        }
    }

    /// Check if this phase allows moving to `target`.
    pub fn can_transition_to(&self, target: WorkerPhase) -> bool {
        use WorkerPhase::*;

        matches!(
            (self, target),
            (NotStarted, Looping) | (NotStarted, Stopped) |
            (Looping, Paused) | (Looping, Stopped) |
            (Paused, Looping) | (Paused, Stopped)
        )
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Looping => "looping",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// What the worker should do at a loop boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Execute the next iteration.
    Run,
    /// Queued commands are waiting; service them and check again.
    Drain,
    /// Leave the loop.
    Stop,
}

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    stopped: bool,
    pending: bool,
}

/// Pause flag plus the condition variable a paused worker sleeps on.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<GateState>,
    wake: Condvar,
}

impl PauseGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // nothing panics while holding the lock; recover the flags if it did
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the pause flag. Returns true if it was not already set.
    pub fn pause(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.paused, true)
    }

    /// Clear the pause flag and wake the worker. Returns true if it was set.
    pub fn resume(&self) -> bool {
        let mut state = self.lock();
        let changed = std::mem::replace(&mut state.paused, false);
        self.wake.notify_all();
        changed
    }

    /// Ask the worker to leave its loop; also releases a paused wait.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.wake.notify_all();
    }

    /// Tell the worker that commands are queued for it.
    pub fn kick(&self) {
        self.lock().pending = true;
        self.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Block while paused. `on_park(true)` runs when the caller is about to
    /// sleep and `on_park(false)` when a pause ends in `Run`. Every wake-up
    /// re-checks the flags, so spurious wake-ups just sleep again.
    pub fn wait(&self, mut on_park: impl FnMut(bool)) -> GateOutcome {
        let mut state = self.lock();
        let mut parked = false;
        loop {
            if state.stopped {
                return GateOutcome::Stop;
            }
            if state.pending {
                state.pending = false;
                return GateOutcome::Drain;
            }
            if !state.paused {
                if parked {
                    on_park(false);
                }
                return GateOutcome::Run;
            }
            if !parked {
                parked = true;
                on_park(true);
            }
            state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Requested and last successfully applied priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrioritySnapshot {
    pub intended: PriorityLevel,
    pub applied: Option<PriorityLevel>,
}

impl PrioritySnapshot {
    /// True when the host has not yet accepted the intended level.
    pub fn is_pending(&self) -> bool {
        self.applied != Some(self.intended)
    }
}

/// Priority state written by the policy cycle (intended) and by the worker
/// thread (applied).
#[derive(Debug)]
pub struct PriorityCell {
    inner: Mutex<PrioritySnapshot>,
}

impl PriorityCell {
    pub fn new(intended: PriorityLevel) -> Self {
        Self {
            inner: Mutex::new(PrioritySnapshot {
                intended,
                applied: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PrioritySnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> PrioritySnapshot {
        *self.lock()
    }

    pub fn set_intended(&self, level: PriorityLevel) {
        self.lock().intended = level;
    }

    pub fn set_applied(&self, level: PriorityLevel) {
        self.lock().applied = Some(level);
    }
}

/// Everything the worker thread shares with its handle.
#[derive(Debug)]
pub struct WorkerShared {
    pub gate: PauseGate,
    pub priority: PriorityCell,
    alive: AtomicBool,
    phase: AtomicU8,
    iterations: AtomicU64,
    thread_id: AtomicI32,
}

impl WorkerShared {
    pub fn new(initial: PriorityLevel) -> Self {
        Self {
            gate: PauseGate::default(),
            priority: PriorityCell::new(initial),
            alive: AtomicBool::new(false),
            phase: AtomicU8::new(WorkerPhase::NotStarted.as_u8()),
            iterations: AtomicU64::new(0),
            thread_id: AtomicI32::new(0),
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Store the new phase and return the previous one.
    pub fn set_phase(&self, phase: WorkerPhase) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.swap(phase.as_u8(), Ordering::AcqRel))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_id(&self) -> Option<i32> {
        match self.thread_id.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub fn set_thread_id(&self, tid: i32) {
        self.thread_id.store(tid, Ordering::Release);
    }
}
