//! Worker system: the single long-lived execution unit.
//!
//! Core components:
//! - `state`: worker phase, pause gate, shared priority cell
//! - `worker`: the worker thread and its owning handle

pub mod state;
pub mod worker;

pub use state::{GateOutcome, PauseGate, PrioritySnapshot, WorkerPhase};
pub use worker::{WorkerCommand, WorkerHandle, WorkerOptions};
