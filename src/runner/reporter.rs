//! Result aggregation thread
//!
//! A single consumer owns every piece of run-wide state: total check time,
//! per-device durations and the outcome counters. Workers only send
//! [`CheckReport`]s. The same thread drives coordination heartbeats on a
//! fixed ticker so they keep going while workers are busy on slow checks.
//!
//! The thread stops once every report sender has been dropped and hands its
//! state back as a [`RunSummary`].

use crate::cluster::{Coordinator, Heartbeat};
use crate::devices::DeviceId;
use crate::error::WorkerError;
use crate::runner::advisory::Severity;
use crate::runner::worker::{CheckReport, Outcome};
use crossbeam_channel::{never, select, tick, Receiver};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Aggregated results of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Sum of every check's elapsed time
    pub total_elapsed: Duration,

    /// Elapsed time per device; a repeated id keeps the last value
    pub per_device: HashMap<DeviceId, Duration>,

    /// Devices checked, including failures
    pub processed: u64,

    /// Devices whose check failed
    pub failed: u64,

    /// Devices not checked by this process
    pub skipped: u64,

    /// Heartbeats sent
    pub heartbeats: u64,
}

impl RunSummary {
    /// Fold one report into the summary and log it
    pub fn record(&mut self, report: &CheckReport) {
        let device = report.device;

        match &report.outcome {
            Outcome::Checked { elapsed } | Outcome::Failed { elapsed, .. } => {
                self.total_elapsed += *elapsed;
                self.per_device.insert(device, *elapsed);
                self.processed += 1;

                let secs = elapsed.as_secs_f64();
                let cause = match &report.outcome {
                    Outcome::Failed { cause, .. } => {
                        self.failed += 1;
                        Some(cause.as_str())
                    }
                    _ => None,
                };

                match Severity::classify(*elapsed) {
                    Severity::Slow => warn!(
                        worker = report.worker,
                        device = device,
                        elapsed_secs = secs,
                        error = cause,
                        "Device check took longer than the polling interval"
                    ),
                    Severity::Normal => info!(
                        worker = report.worker,
                        device = device,
                        elapsed_secs = secs,
                        error = cause,
                        "Device checked"
                    ),
                }
            }
            Outcome::Skipped { reason } => {
                self.skipped += 1;
                info!(worker = report.worker, device = device, reason = %reason, "Device skipped");
            }
        }
    }
}

/// Handle to the reporter thread
pub struct ResultReporter {
    handle: Option<JoinHandle<RunSummary>>,
}

impl ResultReporter {
    /// Spawn the reporter thread
    ///
    /// The heartbeat ticker only runs when the coordinator is active.
    pub fn spawn(
        reports: Receiver<CheckReport>,
        coordinator: Arc<Coordinator>,
        progress: Option<ProgressBar>,
    ) -> Result<Self, WorkerError> {
        let handle = thread::Builder::new()
            .name("check-reporter".into())
            .spawn(move || reporter_thread(reports, coordinator, progress))
            .map_err(|e| WorkerError::Reporter(format!("Failed to spawn reporter thread: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the thread to drain the channel and return the summary
    ///
    /// Every report sender must be dropped first or this blocks forever.
    pub fn join(mut self) -> Result<RunSummary, WorkerError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| WorkerError::Reporter("Reporter thread panicked".into())),
            None => Ok(RunSummary::default()),
        }
    }
}

fn reporter_thread(
    reports: Receiver<CheckReport>,
    coordinator: Arc<Coordinator>,
    progress: Option<ProgressBar>,
) -> RunSummary {
    let mut summary = RunSummary::default();

    let ticker = if coordinator.is_active() {
        tick(coordinator.config().heartbeat_interval)
    } else {
        never()
    };

    loop {
        select! {
            recv(reports) -> msg => match msg {
                Ok(report) => {
                    summary.record(&report);
                    if let Some(bar) = &progress {
                        bar.inc(1);
                        bar.set_message(format!(
                            "checked {} | failed {} | skipped {}",
                            summary.processed, summary.failed, summary.skipped
                        ));
                    }
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                summary.heartbeats += 1;
                if coordinator.heartbeat() == Heartbeat::LostCache {
                    warn!("Coordination disabled for the rest of this run");
                }
            },
        }
    }

    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }

    debug!(
        processed = summary.processed,
        failed = summary.failed,
        skipped = summary.skipped,
        "Result reporter finished"
    );
    summary
}
