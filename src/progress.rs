//! Console output for check runs
//!
//! Provides the progress bar and the header, summary and advisory blocks.

use crate::cluster::Role;
use crate::runner::{Advisory, RunReport, POLLING_INTERVAL};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress bar advanced once per device
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter; the length is set once devices are known
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Handle for the thread that advances the bar
    pub fn bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header at the start of the run
pub fn print_header(workers: usize, source: &str, cluster: Option<&str>) {
    println!();
    println!(
        "{} {}",
        style("check-runner").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Workers:").bold(), workers);
    println!("  {} {}", style("Devices:").bold(), source);
    match cluster {
        Some(name) => println!("  {} {}", style("Cluster:").bold(), name),
        None => println!("  {} local only", style("Cluster:").bold()),
    }
    println!();
}

/// Print a summary of the run
pub fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    let duration_secs = report.duration.as_secs_f64();

    println!();
    if report.completed {
        println!("{}", style("Run Complete").green().bold());
    } else {
        println!("{}", style("Run Interrupted").yellow().bold());
    }
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Checked:").bold(),
        format_number(summary.processed)
    );
    if summary.failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(summary.failed)
        );
    }
    if summary.skipped > 0 {
        println!(
            "  {} {}",
            style("Skipped:").bold(),
            format_number(summary.skipped)
        );
    }
    if report.discarded > 0 {
        println!(
            "  {} {}",
            style("Not started:").yellow().bold(),
            format_number(report.discarded as u64)
        );
    }
    println!(
        "  {} {:.1}s ({:.1}s of checks on {} workers)",
        style("Duration:").bold(),
        duration_secs,
        summary.total_elapsed.as_secs_f64(),
        report.workers
    );
    if report.role != Role::Disabled {
        println!("  {} {}", style("Role:").bold(), report.role);
    }
    if report.cleanup.leases_cleared > 0 {
        println!(
            "  {} {}",
            style("Locks cleared:").bold(),
            format_number(report.cleanup.leases_cleared)
        );
    }
    println!();
}

/// Print the performance advisory, if the run overran the interval
pub fn print_advisory(report: &RunReport) {
    let interval = POLLING_INTERVAL.as_secs();

    match &report.advisory {
        Advisory::WithinBudget => {}
        Advisory::Recommend { workers } => {
            println!(
                "{} Checks took {:.0}s, longer than the {}s polling interval.",
                style("WARNING:").red().bold(),
                report.duration.as_secs_f64(),
                interval
            );
            println!(
                "  Consider raising the worker count to at least {}.",
                style(workers).bold()
            );
            println!();
        }
        Advisory::CannotRecommend { slow_devices } => {
            let ids: Vec<String> = slow_devices.iter().map(|d| d.to_string()).collect();
            println!(
                "{} Checks took {:.0}s, longer than the {}s polling interval.",
                style("WARNING:").red().bold(),
                report.duration.as_secs_f64(),
                interval
            );
            println!(
                "  Cannot recommend a worker count: device(s) {} alone took longer than {}s.",
                ids.join(", "),
                interval
            );
            println!();
        }
    }
}
