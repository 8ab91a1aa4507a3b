//! Device collaborators
//!
//! - [`DeviceSource`]: enumerates the device ids to check, once per run
//! - [`CheckExecutor`]: runs the check for one device

mod executor;
mod source;

pub use executor::{CheckExecutor, CommandExecutor};
pub use source::{DeviceSource, SqliteDeviceSource, StaticDeviceSource};

/// Identifier of a monitored device
pub type DeviceId = u64;
