//! Configuration types for check-runner
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The JSON settings file
//! - Runtime configuration with validation

use crate::devices::DeviceId;
use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Maximum reasonable worker count
pub const MAX_WORKERS: usize = 512;

/// Default cache URL when distributed mode is on and none is configured
const DEFAULT_CACHE_URL: &str = "redis://127.0.0.1:6379/";

/// Default key prefix for cluster keys
const DEFAULT_KEY_PREFIX: &str = "service";

/// Parallel per-device service checks
#[derive(Parser, Debug, Clone)]
#[command(
    name = "check-runner",
    version,
    about = "Run per-device service checks in parallel",
    long_about = "Runs the service check command once for every device that has services,\n\
                  spreading devices over a pool of worker threads.\n\n\
                  With distributed polling enabled, hosts sharing one cache split the\n\
                  devices between them so each device is checked once per run.",
    after_help = "EXAMPLES:\n    \
        check-runner 16\n    \
        check-runner 8 -d -c /etc/check-runner.json\n    \
        check-runner 4 --devices 12,15,20 -p"
)]
pub struct CliArgs {
    /// Number of worker threads (1 if missing or not a positive number)
    #[arg(value_name = "WORKERS")]
    pub workers: Option<String>,

    /// Pass the debug flag to each check and keep its output in a per-device log
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Settings file
    #[arg(
        short = 'c',
        long,
        env = "CHECK_RUNNER_CONFIG",
        default_value = "config.json",
        value_name = "FILE"
    )]
    pub config: PathBuf,

    /// Show a progress bar
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (debug-level logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Node name in the cluster (overrides the settings file)
    #[arg(long, value_name = "NAME")]
    pub node_name: Option<String>,

    /// Check only these devices instead of querying the database
    #[arg(long, value_name = "IDS", value_delimiter = ',')]
    pub devices: Option<Vec<DeviceId>>,
}

/// Parse the positional worker count
///
/// A missing, non-numeric or zero value means one worker. Values above
/// [`MAX_WORKERS`] are rejected.
pub fn parse_workers(raw: Option<&str>) -> Result<usize, ConfigError> {
    let count = raw
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1);

    if count > MAX_WORKERS {
        return Err(ConfigError::InvalidWorkerCount {
            count,
            max: MAX_WORKERS,
        });
    }
    Ok(count)
}

/// Poller group as written in the settings file: `2`, `[1, 2]` or `"1,2"`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PollerGroupSpec {
    One(i64),
    Many(Vec<i64>),
    Text(String),
}

impl PollerGroupSpec {
    /// Expand into a list of group ids
    pub fn groups(&self) -> Result<Vec<i64>, ConfigError> {
        match self {
            PollerGroupSpec::One(id) => Ok(vec![*id]),
            PollerGroupSpec::Many(ids) => Ok(ids.clone()),
            PollerGroupSpec::Text(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<i64>().map_err(|_| ConfigError::InvalidPollerGroup {
                        value: text.clone(),
                    })
                })
                .collect(),
        }
    }
}

/// Contents of the JSON settings file
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Directory for per-device debug logs
    pub log_dir: PathBuf,

    /// SQLite database holding devices and services
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Check program followed by its fixed arguments
    #[serde(default)]
    pub check_command: Vec<String>,

    /// Share the run with other hosts through the cache
    #[serde(default)]
    pub distributed_poller: bool,

    /// Name of this host in the cluster
    #[serde(default)]
    pub distributed_poller_name: Option<String>,

    /// Only check devices in these poller groups
    #[serde(default)]
    pub distributed_poller_group: Option<PollerGroupSpec>,

    /// Shared cache URL
    #[serde(default)]
    pub distributed_cache_url: Option<String>,

    /// Prefix for every cluster key
    #[serde(default)]
    pub cache_key_prefix: Option<String>,
}

impl Settings {
    /// Read and parse a settings file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&text).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }
}

/// Cluster settings, present only in distributed mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Identity written into master and lease keys
    pub node_name: String,

    /// Shared cache URL
    pub cache_url: String,

    /// Prefix for every cluster key
    pub key_prefix: String,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of worker threads
    pub worker_count: usize,

    /// Pass the debug flag to checks
    pub debug: bool,

    /// Show progress bar
    pub show_progress: bool,

    /// Directory for per-device debug logs
    pub log_dir: PathBuf,

    /// Device database; `None` when devices come from the command line
    pub db_path: Option<PathBuf>,

    /// Check program
    pub check_program: PathBuf,

    /// Fixed arguments placed before `-h <device>`
    pub check_args: Vec<String>,

    /// Explicit device list
    pub devices: Option<Vec<DeviceId>>,

    /// Poller group filter for the device query
    pub poller_groups: Vec<i64>,

    /// Cluster settings
    pub distributed: Option<DistributedConfig>,
}

impl RunConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let settings = Settings::load(&args.config)?;
        Self::from_parts(args, settings)
    }

    /// Combine CLI arguments with already loaded settings
    pub fn from_parts(args: CliArgs, settings: Settings) -> Result<Self, ConfigError> {
        let worker_count = parse_workers(args.workers.as_deref())?;

        let mut command = settings.check_command.into_iter();
        let check_program = command
            .next()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::EmptyCheckCommand)?;
        let check_args: Vec<String> = command.collect();

        if !settings.log_dir.is_dir() {
            return Err(ConfigError::MissingLogDir {
                path: settings.log_dir,
            });
        }

        let devices = args.devices.filter(|d| !d.is_empty());
        if devices.is_none() && settings.db_path.is_none() {
            return Err(ConfigError::MissingRequired("db_path".into()));
        }

        let poller_groups = match &settings.distributed_poller_group {
            Some(spec) => spec.groups()?,
            None => Vec::new(),
        };

        let distributed = if settings.distributed_poller {
            let node_name = args
                .node_name
                .or(settings.distributed_poller_name)
                .filter(|n| !n.trim().is_empty())
                .or_else(local_hostname)
                .ok_or_else(|| ConfigError::MissingRequired("distributed_poller_name".into()))?;

            Some(DistributedConfig {
                node_name,
                cache_url: settings
                    .distributed_cache_url
                    .unwrap_or_else(|| DEFAULT_CACHE_URL.to_string()),
                key_prefix: settings
                    .cache_key_prefix
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            worker_count,
            debug: args.debug,
            show_progress: args.progress,
            log_dir: settings.log_dir,
            db_path: settings.db_path,
            check_program,
            check_args,
            devices,
            poller_groups,
            distributed,
        })
    }
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["check-runner"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    fn settings(log_dir: &Path, extra: &str) -> Settings {
        let json = format!(
            r#"{{
                "log_dir": "{}",
                "db_path": "/var/lib/checks/devices.db",
                "check_command": ["/usr/bin/php", "check-services.php"]{}
            }}"#,
            log_dir.display(),
            extra
        );
        Settings::parse(&json).unwrap()
    }

    #[test]
    fn test_parse_workers() {
        assert_eq!(parse_workers(None).unwrap(), 1);
        assert_eq!(parse_workers(Some("abc")).unwrap(), 1);
        assert_eq!(parse_workers(Some("0")).unwrap(), 1);
        assert_eq!(parse_workers(Some("-3")).unwrap(), 1);
        assert_eq!(parse_workers(Some("16")).unwrap(), 16);
        assert_eq!(parse_workers(Some("512")).unwrap(), 512);
        assert!(matches!(
            parse_workers(Some("513")),
            Err(ConfigError::InvalidWorkerCount { count: 513, max: 512 })
        ));
    }

    #[test]
    fn test_cli_flags() {
        let args = args(&["8", "-d", "-p", "--node-name", "poller-2", "--devices", "3,4,9"]);
        assert_eq!(args.workers.as_deref(), Some("8"));
        assert!(args.debug);
        assert!(args.progress);
        assert!(!args.verbose);
        assert_eq!(args.node_name.as_deref(), Some("poller-2"));
        assert_eq!(args.devices, Some(vec![3, 4, 9]));
    }

    #[test]
    fn test_local_config() {
        let dir = tempdir().unwrap();
        let config = RunConfig::from_parts(args(&["4"]), settings(dir.path(), "")).unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.check_program, PathBuf::from("/usr/bin/php"));
        assert_eq!(config.check_args, vec!["check-services.php".to_string()]);
        assert!(config.distributed.is_none());
        assert!(config.poller_groups.is_empty());
    }

    #[test]
    fn test_distributed_config() {
        let dir = tempdir().unwrap();
        let extra = r#",
            "distributed_poller": true,
            "distributed_poller_name": "poller-1",
            "distributed_poller_group": "1, 3",
            "cache_key_prefix": "checks""#;

        let config = RunConfig::from_parts(args(&[]), settings(dir.path(), extra)).unwrap();
        let distributed = config.distributed.unwrap();
        assert_eq!(distributed.node_name, "poller-1");
        assert_eq!(distributed.cache_url, DEFAULT_CACHE_URL);
        assert_eq!(distributed.key_prefix, "checks");
        assert_eq!(config.poller_groups, vec![1, 3]);

        // CLI name wins over the settings file
        let config = RunConfig::from_parts(
            args(&["--node-name", "override"]),
            settings(dir.path(), extra),
        )
        .unwrap();
        assert_eq!(config.distributed.unwrap().node_name, "override");
    }

    #[test]
    fn test_poller_group_forms() {
        assert_eq!(PollerGroupSpec::One(2).groups().unwrap(), vec![2]);
        assert_eq!(PollerGroupSpec::Many(vec![1, 2]).groups().unwrap(), vec![1, 2]);
        assert!(matches!(
            PollerGroupSpec::Text("1,x".into()).groups(),
            Err(ConfigError::InvalidPollerGroup { .. })
        ));
    }

    #[test]
    fn test_validation_errors() {
        let dir = tempdir().unwrap();

        let mut no_command = settings(dir.path(), "");
        no_command.check_command.clear();
        assert!(matches!(
            RunConfig::from_parts(args(&[]), no_command),
            Err(ConfigError::EmptyCheckCommand)
        ));

        let missing_dir = settings(&dir.path().join("missing"), "");
        assert!(matches!(
            RunConfig::from_parts(args(&[]), missing_dir),
            Err(ConfigError::MissingLogDir { .. })
        ));

        let mut no_db = settings(dir.path(), "");
        no_db.db_path = None;
        assert!(matches!(
            RunConfig::from_parts(args(&[]), no_db.clone()),
            Err(ConfigError::MissingRequired(_))
        ));
        assert!(RunConfig::from_parts(args(&["--devices", "1"]), no_db).is_ok());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Settings::load(&dir.path().join("absent.json")),
            Err(ConfigError::Unreadable { .. })
        ));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(Settings::load(&bad), Err(ConfigError::Parse { .. })));
    }
}
