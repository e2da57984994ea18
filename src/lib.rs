//! Worker Keeper: a long-lived CPU-bound worker thread whose scheduling
//! priority follows host load.

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod priority;
pub mod probe;
pub mod respawn;
pub mod supervisor;
pub mod worker;
pub mod workload;
