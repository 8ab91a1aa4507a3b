//! Parallel device check runner
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────────────┐
//!                     │       Supervisor        │
//!                     │  - device list          │
//!                     │  - cluster join/finish  │
//!                     └───────────┬─────────────┘
//!                                 │ WorkQueue
//!       ┌─────────────────────────┼─────────────────────────┐
//!       │                         │                         │
//! ┌─────▼─────┐             ┌─────▼─────┐             ┌─────▼─────┐
//! │  Worker 1 │             │  Worker 2 │             │  Worker N │
//! │  lease    │             │  lease    │             │  lease    │
//! │  check    │             │  check    │             │  check    │
//! └─────┬─────┘             └─────┬─────┘             └─────┬─────┘
//!       └─────────────────────────┼─────────────────────────┘
//!                                 │ CheckReport
//!                     ┌───────────▼─────────────┐
//!                     │     ResultReporter      │
//!                     │  - RunSummary           │
//!                     │  - heartbeat ticker     │
//!                     └─────────────────────────┘
//! ```

pub mod advisory;
pub mod queue;
pub mod reporter;
pub mod supervisor;
pub mod worker;

pub use advisory::{Advisory, Severity, POLLING_INTERVAL};
pub use queue::{Poll, WorkItem, WorkQueue};
pub use reporter::{ResultReporter, RunSummary};
pub use supervisor::{RunReport, Supervisor};
pub use worker::{CheckReport, Outcome, PoolTotals, SkipReason, WorkerContext, WorkerPool};
