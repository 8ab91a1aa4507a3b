//! Post-run performance advisory
//!
//! A run is expected to fit in one polling interval. When it does not, the
//! advisory suggests a worker count that would, unless a single device already
//! takes longer than the whole interval.

use crate::devices::DeviceId;
use std::collections::HashMap;
use std::time::Duration;

/// Time a full run, and any single check, should fit in
pub const POLLING_INTERVAL: Duration = Duration::from_secs(300);

/// Log level for a completed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Slow,
}

impl Severity {
    /// A check that took the whole interval or longer is slow
    pub fn classify(elapsed: Duration) -> Self {
        if elapsed >= POLLING_INTERVAL {
            Severity::Slow
        } else {
            Severity::Normal
        }
    }
}

/// Advice printed after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// The run fit in the interval
    WithinBudget,
    /// Minimum worker count that should fit the interval
    Recommend { workers: usize },
    /// More workers would not help; these devices alone exceed the interval
    CannotRecommend { slow_devices: Vec<DeviceId> },
}

impl Advisory {
    /// Evaluate a run of `total` wall time on `workers` workers
    pub fn evaluate(total: Duration, workers: usize, per_device: &HashMap<DeviceId, Duration>) -> Self {
        if total <= POLLING_INTERVAL {
            return Advisory::WithinBudget;
        }

        let mut slow_devices: Vec<DeviceId> = per_device
            .iter()
            .filter(|(_, elapsed)| **elapsed > POLLING_INTERVAL)
            .map(|(device, _)| *device)
            .collect();

        if !slow_devices.is_empty() {
            slow_devices.sort_unstable();
            return Advisory::CannotRecommend { slow_devices };
        }

        Advisory::Recommend {
            workers: recommended_workers(total, workers),
        }
    }

    /// True if the run overran the interval
    pub fn is_over_budget(&self) -> bool {
        !matches!(self, Advisory::WithinBudget)
    }
}

/// `ceil(total / interval * workers) + 1`
pub fn recommended_workers(total: Duration, workers: usize) -> usize {
    let needed = total.as_millis() * workers as u128;
    let interval = POLLING_INTERVAL.as_millis();
    needed.div_ceil(interval) as usize + 1
}
