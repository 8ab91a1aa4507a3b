//! Per-device check execution
//!
//! [`CommandExecutor`] runs the external check program once per device and
//! waits for it, so a check is never left running after its worker moves on.

use crate::devices::DeviceId;
use crate::error::CheckError;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Runs the check for one device
pub trait CheckExecutor: Send + Sync {
    /// Check a device; `Err` for any failure, including non-zero exit
    fn check(&self, device: DeviceId, debug: bool) -> Result<(), CheckError>;
}

/// Executes an external program: `<program> <args..> -h <device> [-d]`
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    log_dir: PathBuf,
}

impl CommandExecutor {
    /// Create an executor
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, log_dir: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Debug log path for a device
    pub fn log_path(&self, device: DeviceId) -> PathBuf {
        self.log_dir.join(format!("services_device_{}.log", device))
    }

    fn build(&self, device: DeviceId, debug: bool) -> Result<Command, CheckError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-h")
            .arg(device.to_string())
            .stdin(Stdio::null());

        // Keep a terminal interrupt away from running checks
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        if debug {
            cmd.arg("-d");

            let path = self.log_path(device);
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| CheckError::Log {
                    path: path.clone(),
                    source,
                })?;
            let log_err = log.try_clone().map_err(|source| CheckError::Log { path, source })?;

            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        Ok(cmd)
    }
}

impl CheckExecutor for CommandExecutor {
    fn check(&self, device: DeviceId, debug: bool) -> Result<(), CheckError> {
        let status = self
            .build(device, debug)?
            .status()
            .map_err(|source| CheckError::Spawn { device, source })?;

        if status.success() {
            return Ok(());
        }

        match status.code() {
            Some(code) => Err(CheckError::ExitStatus { device, code }),
            None => Err(CheckError::Signalled { device }),
        }
    }
}
