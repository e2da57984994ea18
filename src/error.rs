//! Error types for the worker keeper.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the keeper.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Priority error: {0}")]
    Priority(#[from] PriorityError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Respawn error: {0}")]
    Respawn(#[from] RespawnError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Utilization counter read failures.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed counter line: {0}")]
    Malformed(String),
}

/// Host scheduling failures.
#[derive(Debug, thiserror::Error)]
pub enum PriorityError {
    #[error("Host refused priority {level} for thread {tid}: {source}")]
    Refused {
        tid: i32,
        level: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read priority of thread {tid}: {source}")]
    Query {
        tid: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Worker {id} panicked")]
    Panicked { id: Uuid },
}

/// Restart-guarantee registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RespawnError {
    #[error("Failed to persist registration at {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt registration at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to launch {what}: {source}")]
    Launch {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid respawn interval {0:?}")]
    InvalidInterval(Duration),
}

/// Control surface errors (client side and server bind).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Failed to bind control surface on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Control surface stopped with an error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("Request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },
}

/// Result type alias for the keeper.
pub type Result<T> = std::result::Result<T, Error>;
