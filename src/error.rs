//! Error types for check-runner
//!
//! This module defines the error hierarchy for a run:
//! - Configuration and CLI errors (fatal before any work starts)
//! - Device source errors (fatal)
//! - Shared cache and coordination errors (mostly degrade to local-only mode)
//! - Per-device check errors (contained inside the worker)
//! - Worker thread errors
//!
//! Only startup-phase failures abort a run. Everything that happens per device
//! ends up as a [`crate::runner::Outcome`] instead.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a check run
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device enumeration errors
    #[error("Device source error: {0}")]
    DeviceSource(#[from] DeviceSourceError),

    /// Fatal coordination errors
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Settings file could not be read
    #[error("Cannot read settings file '{path}': {reason}")]
    Unreadable { path: PathBuf, reason: String },

    /// Settings file is not valid JSON for the expected shape
    #[error("Cannot parse settings file '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Invalid poller group list
    #[error("Invalid poller group '{value}': expected a comma separated list of integers")]
    InvalidPollerGroup { value: String },

    /// Check command is empty
    #[error("Check command must name a program")]
    EmptyCheckCommand,

    /// Log directory missing
    #[error("Log directory '{path}' does not exist")]
    MissingLogDir { path: PathBuf },

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Device enumeration errors
#[derive(Error, Debug)]
pub enum DeviceSourceError {
    /// Could not open the device database
    #[error("Cannot open device database '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    /// Query failed
    #[error("Device query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// A device id that cannot name a device
    #[error("Invalid device id {0}")]
    InvalidId(i64),
}

/// Shared cache errors
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Connection to the cache failed
    #[error("Failed to connect to cache at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A cache command failed
    #[error("Cache operation '{op}' failed: {reason}")]
    OperationFailed { op: &'static str, reason: String },

    /// Stored value has an unexpected type
    #[error("Unexpected value for key '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::OperationFailed {
            op: "redis",
            reason: err.to_string(),
        }
    }
}

/// Coordination errors that abort the run
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// The master key already carries this node's identity
    #[error("This system ({identity}) is already joined as the service master")]
    StaleMaster { identity: String },
}

/// Errors from a single device check
#[derive(Error, Debug)]
pub enum CheckError {
    /// The check process could not be started
    #[error("Failed to start check for device {device}: {source}")]
    Spawn {
        device: u64,
        #[source]
        source: std::io::Error,
    },

    /// The check process exited with a non-zero status
    #[error("Check for device {device} exited with status {code}")]
    ExitStatus { device: u64, code: i32 },

    /// The check process was killed by a signal
    #[error("Check for device {device} terminated by signal")]
    Signalled { device: u64 },

    /// The debug log file could not be opened
    #[error("Cannot open log '{path}': {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker thread could not be spawned
    #[error("Failed to spawn worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// Reporter thread could not be spawned or panicked
    #[error("Result reporter failed: {0}")]
    Reporter(String),

    /// Work queue was closed while seeding
    #[error("Work queue is closed")]
    QueueClosed,
}

/// Result type alias for RunnerError
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Result type alias for CacheError
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Result type alias for DeviceSourceError
pub type SourceResult<T> = std::result::Result<T, DeviceSourceError>;
