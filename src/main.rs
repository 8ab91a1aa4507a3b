//! check-runner - Parallel Per-Device Service Checks
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use check_runner::cluster::{CoordinationConfig, Coordinator, RedisCache, RedisCacheConfig};
use check_runner::config::{CliArgs, RunConfig};
use check_runner::devices::{CommandExecutor, DeviceSource, SqliteDeviceSource, StaticDeviceSource};
use check_runner::error::ConfigError;
use check_runner::progress::{print_advisory, print_header, print_summary, ProgressReporter};
use check_runner::runner::Supervisor;
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for fatal startup errors, also used when a run overran the
/// polling interval
const EXIT_TROUBLE: u8 = 2;

/// Exit status after a second interrupt
const EXIT_FORCED: i32 = 130;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_TROUBLE)
        }
    }
}

fn run() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose || args.debug)?;

    // Validate and create config
    let config = RunConfig::from_args(args).context("Invalid configuration")?;

    let source = device_source(&config).context("Invalid configuration")?;
    let executor = Arc::new(CommandExecutor::new(
        config.check_program.clone(),
        config.check_args.clone(),
        &config.log_dir,
    ));
    let coordinator = Arc::new(coordinator(&config));

    if config.show_progress {
        print_header(
            config.worker_count,
            &source_name(&config),
            config.distributed.as_ref().map(|d| d.node_name.as_str()),
        );
    }

    let mut supervisor = Supervisor::new(config.worker_count, source, executor, coordinator).debug(config.debug);

    // Create progress reporter
    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };
    if let Some(ref p) = progress {
        p.set_status("Fetching devices...");
        supervisor = supervisor.progress(p.bar());
    }

    // First interrupt stops new checks, a second one exits immediately
    let shutdown_flag = supervisor.shutdown_flag();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nSecond interrupt, exiting now");
            std::process::exit(EXIT_FORCED);
        }
        eprintln!("\nInterrupt received, waiting for running checks...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let report = match supervisor.run() {
        Ok(report) => report,
        Err(e) => {
            if let Some(ref p) = progress {
                p.finish_and_clear();
            }
            return Err(e).context("Run failed");
        }
    };

    print_summary(&report);
    print_advisory(&report);

    if !report.completed {
        info!(discarded = report.discarded, "Run was interrupted before completion");
    }

    if report.advisory.is_over_budget() {
        return Ok(ExitCode::from(EXIT_TROUBLE));
    }
    Ok(ExitCode::SUCCESS)
}

fn device_source(config: &RunConfig) -> Result<Box<dyn DeviceSource>, ConfigError> {
    match (&config.devices, &config.db_path) {
        (Some(ids), _) => Ok(Box::new(StaticDeviceSource::new(ids.iter().copied()))),
        (None, Some(path)) => Ok(Box::new(
            SqliteDeviceSource::new(path).with_poller_groups(config.poller_groups.clone()),
        )),
        (None, None) => Err(ConfigError::MissingRequired("db_path".into())),
    }
}

fn source_name(config: &RunConfig) -> String {
    match (&config.devices, &config.db_path) {
        (Some(ids), _) => format!("{} from command line", ids.len()),
        (None, Some(path)) => path.display().to_string(),
        (None, None) => "none".to_string(),
    }
}

fn coordinator(config: &RunConfig) -> Coordinator {
    let Some(distributed) = &config.distributed else {
        return Coordinator::disabled();
    };

    let coordination = CoordinationConfig {
        key_prefix: distributed.key_prefix.clone(),
        ..Default::default()
    };

    match RedisCache::new(RedisCacheConfig::with_url(&distributed.cache_url)) {
        Ok(cache) => Coordinator::new(Arc::new(cache), distributed.node_name.clone(), coordination),
        Err(e) => {
            warn!(error = %e, "Could not reach the shared cache, disabling distributed checks");
            Coordinator::disabled()
        }
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("check_runner=debug,warn")
    } else {
        EnvFilter::new("check_runner=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
