//! Run supervisor - orchestrates one pass over every device
//!
//! The supervisor is responsible for:
//! - Fetching the device list and joining the cluster
//! - Seeding the work queue and starting the reporter and workers
//! - Waiting for the queue to drain, or discarding it on shutdown
//! - The end-of-run cluster sequence
//! - The performance advisory

use crate::cluster::{CleanupReport, Coordinator, Role};
use crate::devices::{CheckExecutor, DeviceSource};
use crate::error::Result;
use crate::runner::advisory::Advisory;
use crate::runner::queue::WorkQueue;
use crate::runner::reporter::{ResultReporter, RunSummary};
use crate::runner::worker::{WorkerContext, WorkerPool};
use chrono::{DateTime, Local};
use crossbeam_channel::unbounded;
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between checks of the queue and the shutdown flag
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Result of a completed run
#[derive(Debug)]
pub struct RunReport {
    /// Aggregated check results
    pub summary: RunSummary,

    /// Wall time of the whole run, cluster cleanup included
    pub duration: Duration,

    /// Worker count the run used
    pub workers: usize,

    /// Role this process ran as
    pub role: Role,

    /// Performance advice
    pub advisory: Advisory,

    /// False if the run was interrupted
    pub completed: bool,

    /// Devices dropped from the queue on shutdown
    pub discarded: usize,

    /// End-of-run cluster cleanup
    pub cleanup: CleanupReport,
}

/// Orchestrates a run
pub struct Supervisor {
    workers: usize,
    debug: bool,
    source: Box<dyn DeviceSource>,
    executor: Arc<dyn CheckExecutor>,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl Supervisor {
    /// Create a supervisor running `workers` threads
    pub fn new(
        workers: usize,
        source: Box<dyn DeviceSource>,
        executor: Arc<dyn CheckExecutor>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            debug: false,
            source,
            executor,
            coordinator,
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Pass the debug flag to every check
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Advance this bar once per device
    pub fn progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Get a clone of the shutdown flag (for signal handlers)
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run every device once
    pub fn run(self) -> Result<RunReport> {
        let start_time = Instant::now();

        let devices = self.source.devices()?;
        let role = self.coordinator.join()?;

        // Only the master sweeps leases, so only it needs the range
        let range = match role {
            Role::Master => self.source.id_range()?,
            _ => None,
        };

        let started: DateTime<Local> = Local::now();
        info!(
            start = %started.format("%Y-%m-%d %H:%M:%S"),
            workers = self.workers,
            devices = devices.len(),
            role = %role,
            "Starting device checks"
        );

        let queue = WorkQueue::new();
        for &device in &devices {
            queue.enqueue(device)?;
        }
        queue.close();

        if let Some(bar) = &self.progress {
            bar.set_length(devices.len() as u64);
        }

        let (reports_tx, reports_rx) = unbounded();
        let reporter = ResultReporter::spawn(reports_rx, Arc::clone(&self.coordinator), self.progress.clone())?;

        let pool = WorkerPool::spawn(
            self.workers,
            WorkerContext {
                queue: queue.clone(),
                coordinator: Arc::clone(&self.coordinator),
                executor: Arc::clone(&self.executor),
                reports: reports_tx,
                shutdown: Arc::clone(&self.shutdown),
                debug: self.debug,
            },
        )?;

        let (completed, discarded) = self.wait_for_completion(&queue);

        // Workers exit once the queue is closed and empty
        self.shutdown.store(true, Ordering::SeqCst);
        match pool.join() {
            Ok(totals) => debug!(
                checked = totals.checked,
                failed = totals.failed,
                skipped = totals.skipped,
                "Workers joined"
            ),
            Err(e) => warn!(error = %e, "Worker failed to join cleanly"),
        }

        // The pool held the last report senders
        let summary = reporter.join()?;

        let cleanup = self.coordinator.finish(range);
        let duration = start_time.elapsed();
        let advisory = Advisory::evaluate(duration, self.workers, &summary.per_device);

        info!(
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_secs = duration.as_secs_f64(),
            completed = completed,
            "Run finished"
        );

        Ok(RunReport {
            summary,
            duration,
            workers: self.workers,
            role,
            advisory,
            completed,
            discarded,
            cleanup,
        })
    }

    /// Wait for the queue to drain or for a shutdown request
    fn wait_for_completion(&self, queue: &WorkQueue) -> (bool, usize) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                let discarded = queue.discard_pending();
                info!(discarded = discarded, "Shutdown requested, waiting for running checks");
                queue.join_all();
                return (false, discarded);
            }

            if queue.join_timeout(WAIT_POLL) {
                return (true, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{KvCache, MemoryCache};
    use crate::devices::{DeviceId, StaticDeviceSource};
    use crate::error::{CheckError, CoordinationError, RunnerError};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    struct Sleepy {
        delay: Duration,
        seen: Mutex<Vec<DeviceId>>,
    }

    impl Sleepy {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl CheckExecutor for Sleepy {
        fn check(&self, device: DeviceId, _debug: bool) -> std::result::Result<(), CheckError> {
            thread::sleep(self.delay);
            self.seen.lock().unwrap().push(device);
            Ok(())
        }
    }

    #[test]
    fn test_local_run_checks_every_device() {
        let exec = Sleepy::new(Duration::from_millis(10));
        let supervisor = Supervisor::new(
            2,
            Box::new(StaticDeviceSource::new([1, 2, 3])),
            exec.clone(),
            Arc::new(Coordinator::disabled()),
        );

        let report = supervisor.run().unwrap();

        assert!(report.completed);
        assert_eq!(report.role, Role::Disabled);
        assert_eq!(report.summary.processed, 3);
        assert_eq!(report.summary.skipped, 0);
        assert_eq!(report.advisory, Advisory::WithinBudget);
        assert_eq!(report.cleanup, CleanupReport::default());

        let seen: HashSet<_> = exec.seen.lock().unwrap().iter().copied().collect();
        assert_eq!(seen, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn test_shutdown_discards_pending_devices() {
        let exec = Sleepy::new(Duration::from_millis(50));
        let supervisor = Supervisor::new(
            1,
            Box::new(StaticDeviceSource::new(1..=20)),
            exec.clone(),
            Arc::new(Coordinator::disabled()),
        );

        let shutdown = supervisor.shutdown_flag();
        let handle = thread::spawn(move || supervisor.run());

        thread::sleep(Duration::from_millis(120));
        shutdown.store(true, Ordering::SeqCst);

        let report = handle.join().unwrap().unwrap();
        assert!(!report.completed);
        assert!(report.discarded > 0);

        // Every dequeued device ran to completion and was reported
        let checked = exec.seen.lock().unwrap().len() as u64;
        assert_eq!(report.summary.processed, checked);
        assert_eq!(checked + report.discarded as u64, 20);
    }

    #[test]
    fn test_stale_master_aborts_before_checks() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("service.master", "poller-1", Duration::from_secs(10)).unwrap();

        let exec = Sleepy::new(Duration::ZERO);
        let coordinator = Coordinator::new(cache as Arc<dyn KvCache>, "poller-1", Default::default());
        let supervisor = Supervisor::new(
            2,
            Box::new(StaticDeviceSource::new([1, 2])),
            exec.clone(),
            Arc::new(coordinator),
        );

        let err = supervisor.run().unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Coordination(CoordinationError::StaleMaster { .. })
        ));
        assert!(exec.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_master_run_cleans_up() {
        let cache = Arc::new(MemoryCache::new());
        let exec = Sleepy::new(Duration::ZERO);
        let coordinator = Coordinator::new(cache.clone() as Arc<dyn KvCache>, "poller-1", Default::default());
        let supervisor = Supervisor::new(
            2,
            Box::new(StaticDeviceSource::new([3, 5, 8])),
            exec,
            Arc::new(coordinator),
        );

        let report = supervisor.run().unwrap();
        assert_eq!(report.role, Role::Master);
        assert_eq!(report.summary.processed, 3);
        assert_eq!(report.cleanup.leases_cleared, 6);
        assert!(cache.is_empty());
    }
}
