//! Supervisor system.
//!
//! - `state`: service lifecycle and the status snapshot
//! - `service`: the supervisor that owns the worker and the probe cycle

pub mod service;
pub mod state;

pub use service::{
    CounterSourceFactory, Supervisor, SupervisorConfig, SupervisorDeps, WorkloadFactory,
};
pub use state::{ServiceLifecycleState, StartDisposition, SupervisorStatus};
