//! check-runner - Parallel Per-Device Service Checks
//!
//! Runs an external service check once for every monitored device, spreading
//! the devices over a fixed pool of worker threads. Several hosts can share a
//! run through a common cache so each device is checked by exactly one host.
//!
//! # Features
//!
//! - **Parallel Checks**: A fixed pool of worker threads pulls device ids from
//!   a shared queue. Each check is an external process that is always waited on.
//!
//! - **Distributed Runs**: Master election, per-device leases and node
//!   heartbeats over Redis. A host that loses the cache falls back to
//!   checking on its own.
//!
//! - **Single Aggregator**: One reporter thread owns all timing data and
//!   drives cluster heartbeats independently of check progress.
//!
//! - **Performance Advisory**: After a run that overran the polling interval,
//!   suggests a worker count that would fit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────────────┐
//! │   Device database    │          │        Shared cache          │
//! │   (SQLite)           │          │  master / nodes / leases     │
//! └──────────┬───────────┘          └───────────────▲──────────────┘
//!            │ device ids                           │
//!            ▼                                      │
//! ┌─────────────────────────────────────────────────┼──────────────┐
//! │                      Supervisor                 │              │
//! │  ┌────────────────┐      ┌──────────────────────┴───────────┐  │
//! │  │   WorkQueue    │─────►│  Worker 1 .. Worker N            │  │
//! │  └────────────────┘      │  lease → check process → report  │  │
//! │                          └───────────────┬──────────────────┘  │
//! │                                          ▼                     │
//! │                          ┌──────────────────────────────────┐  │
//! │                          │  ResultReporter + heartbeats     │  │
//! │                          └──────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Sixteen workers, settings from ./config.json
//! check-runner 16
//!
//! # Debug logs per device, explicit settings file
//! check-runner 8 -d -c /etc/check-runner.json
//! ```

pub mod cluster;
pub mod config;
pub mod devices;
pub mod error;
pub mod progress;
pub mod runner;

pub use config::{CliArgs, RunConfig};
pub use error::{Result, RunnerError};
pub use runner::{RunReport, Supervisor};
