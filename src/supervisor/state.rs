//! Service lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::priority::PriorityLevel;
use crate::worker::WorkerPhase;

/// Lifecycle of the supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLifecycleState {
    Stopped,
    /// Start requested, waiting for the worker to report in.
    Starting,
    Running,
    Paused,
    /// Stop requested, worker being torn down.
    Terminating,
}

impl ServiceLifecycleState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ServiceLifecycleState) -> bool {
        use ServiceLifecycleState::*;

        matches!(
            (self, target),
            // From Stopped
            (Stopped, Starting) |
            // From Starting (ready may arrive with the pause flag already set)
            (Starting, Running) | (Starting, Paused) |
            (Starting, Terminating) | (Starting, Stopped) |
            // From Running
            (Running, Paused) | (Running, Terminating) | (Running, Stopped) |
            // From Paused
            (Paused, Running) | (Paused, Terminating) | (Paused, Stopped) |
            // From Terminating
            (Terminating, Stopped)
        )
    }

    /// Check if a worker is expected to exist in this state.
    pub fn has_worker(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for ServiceLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
        };
        write!(f, "{s}")
    }
}

/// What the host should do if the process is killed; always restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartDisposition {
    Sticky,
}

/// Point-in-time view of the supervisor, served on the status route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: ServiceLifecycleState,
    pub worker_id: Option<Uuid>,
    pub thread_id: Option<i32>,
    pub phase: Option<WorkerPhase>,
    pub intended_priority: Option<PriorityLevel>,
    pub applied_priority: Option<PriorityLevel>,
    pub iterations: u64,
    pub last_utilization: Option<f64>,
    pub next_respawn: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        use ServiceLifecycleState::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Stopped));
    }

    #[test]
    fn lifecycle_invalid_transitions() {
        use ServiceLifecycleState::*;
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Paused));
        assert!(!Terminating.can_transition_to(Running));
        assert!(!Terminating.can_transition_to(Starting));
        assert!(!Paused.can_transition_to(Starting));
    }

    #[test]
    fn worker_expected_only_while_active() {
        assert!(ServiceLifecycleState::Running.has_worker());
        assert!(!ServiceLifecycleState::Stopped.has_worker());
        assert!(!ServiceLifecycleState::Terminating.has_worker());
    }

    #[test]
    fn status_serde_roundtrip() {
        let status = SupervisorStatus {
            state: ServiceLifecycleState::Paused,
            worker_id: Some(Uuid::nil()),
            thread_id: Some(77),
            phase: Some(WorkerPhase::Paused),
            intended_priority: Some(PriorityLevel(3)),
            applied_priority: None,
            iterations: 12,
            last_utilization: Some(42.5),
            next_respawn: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"paused\""));
        let parsed: SupervisorStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
