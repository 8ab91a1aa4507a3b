//! Worker threads that check devices
//!
//! Each worker:
//! - Pulls device ids from the work queue
//! - Asks the coordinator for the device lease
//! - Runs the check and times it
//! - Sends one report per device to the result reporter
//!
//! The shutdown flag is only read between devices. A check that has started
//! always runs to completion.

use crate::cluster::{Coordinator, LeaseOutcome};
use crate::devices::{CheckExecutor, DeviceId};
use crate::error::WorkerError;
use crate::runner::queue::{Poll, WorkQueue};
use crossbeam_channel::Sender;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a worker waits on the queue before re-checking shutdown
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a device was not checked by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another host holds the lease
    Leased { owner: Option<String> },
    /// This node lost the cache; the master picks the device up
    CacheLost,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Leased { owner: Some(owner) } => write!(f, "leased by {}", owner),
            SkipReason::Leased { owner: None } => f.write_str("leased by another node"),
            SkipReason::CacheLost => f.write_str("cache unavailable, left to master"),
        }
    }
}

/// Outcome of processing one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The check ran and succeeded
    Checked { elapsed: Duration },
    /// The check ran and failed
    Failed { elapsed: Duration, cause: String },
    /// The check was not run
    Skipped { reason: SkipReason },
}

impl Outcome {
    /// Elapsed check time, `None` for skipped devices
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Outcome::Checked { elapsed } | Outcome::Failed { elapsed, .. } => Some(*elapsed),
            Outcome::Skipped { .. } => None,
        }
    }
}

/// Message from a worker to the result reporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Worker that handled the device
    pub worker: usize,
    /// Device id
    pub device: DeviceId,
    /// What happened
    pub outcome: Outcome,
}

/// Statistics collected by a worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Devices checked successfully
    pub checked: AtomicU64,

    /// Devices whose check failed
    pub failed: AtomicU64,

    /// Devices skipped
    pub skipped: AtomicU64,
}

impl WorkerStats {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Checked { .. } => &self.checked,
            Outcome::Failed { .. } => &self.failed,
            Outcome::Skipped { .. } => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Totals across every worker in a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolTotals {
    pub checked: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Everything a worker needs, shared across the pool
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: WorkQueue,
    pub coordinator: Arc<Coordinator>,
    pub executor: Arc<dyn CheckExecutor>,
    pub reports: Sender<CheckReport>,
    pub shutdown: Arc<AtomicBool>,
    /// Pass the debug flag to every check
    pub debug: bool,
}

/// A worker thread that checks devices
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Spawn a new worker thread
    pub fn spawn(id: usize, ctx: WorkerContext) -> Result<Self, WorkerError> {
        let stats = Arc::new(WorkerStats::default());
        let stats_clone = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name(format!("check-worker-{}", id))
            .spawn(move || worker_loop(id, ctx, stats_clone))
            .map_err(|e| WorkerError::SpawnFailed {
                id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
            stats,
        })
    }

    /// Worker statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| WorkerError::Panicked {
                id: self.id,
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }
}

fn worker_loop(id: usize, ctx: WorkerContext, stats: Arc<WorkerStats>) {
    debug!(worker = id, "Worker starting");

    while !ctx.shutdown.load(Ordering::Relaxed) {
        let item = match ctx.queue.dequeue_timeout(DEQUEUE_TIMEOUT) {
            Poll::Ready(item) => item,
            Poll::Idle => continue,
            Poll::Closed => break,
        };

        let device = item.device();
        let outcome = process_device(id, device, &ctx);
        stats.record(&outcome);

        let report = CheckReport {
            worker: id,
            device,
            outcome,
        };
        if ctx.reports.send(report).is_err() {
            warn!(worker = id, device = device, "Result reporter is gone, stopping worker");
            break;
        }

        item.done();
    }

    debug!(
        worker = id,
        checked = stats.checked.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        skipped = stats.skipped.load(Ordering::Relaxed),
        "Worker shutting down"
    );
}

/// Lease, check and time one device
fn process_device(worker: usize, device: DeviceId, ctx: &WorkerContext) -> Outcome {
    match ctx.coordinator.try_lease(device) {
        LeaseOutcome::Unsynchronized | LeaseOutcome::Granted => {}
        LeaseOutcome::Contended { owner } => {
            return Outcome::Skipped {
                reason: SkipReason::Leased { owner },
            }
        }
        LeaseOutcome::Abandoned => {
            return Outcome::Skipped {
                reason: SkipReason::CacheLost,
            }
        }
    }

    debug!(worker = worker, device = device, "Checking device");
    let start = Instant::now();

    // A panicking executor must not take the worker down with it
    let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.executor.check(device, ctx.debug)));
    let elapsed = start.elapsed();

    match result {
        Ok(Ok(())) => Outcome::Checked { elapsed },
        Ok(Err(e)) => Outcome::Failed {
            elapsed,
            cause: e.to_string(),
        },
        Err(payload) => Outcome::Failed {
            elapsed,
            cause: format!("check panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed-size set of workers sharing one queue
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `count` workers
    ///
    /// If a thread cannot be spawned, the workers already running are stopped
    /// and joined before the error is returned.
    pub fn spawn(count: usize, ctx: WorkerContext) -> Result<Self, WorkerError> {
        let mut workers = Vec::with_capacity(count);

        for id in 0..count {
            match Worker::spawn(id, ctx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    ctx.shutdown.store(true, Ordering::SeqCst);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(count = workers.len(), "Workers spawned");
        Ok(Self { workers })
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if the pool has no workers
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sum the counters of every worker
    pub fn totals(&self) -> PoolTotals {
        self.workers.iter().fold(PoolTotals::default(), |mut acc, w| {
            let stats = w.stats();
            acc.checked += stats.checked.load(Ordering::Relaxed);
            acc.failed += stats.failed.load(Ordering::Relaxed);
            acc.skipped += stats.skipped.load(Ordering::Relaxed);
            acc
        })
    }

    /// Join every worker; returns the totals or the first panic
    pub fn join(self) -> Result<PoolTotals, WorkerError> {
        let totals = self.totals();
        let mut first_error = None;

        for worker in self.workers {
            if let Err(e) = worker.join() {
                warn!(error = %e, "Worker failed to join cleanly");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(totals),
        }
    }
}
