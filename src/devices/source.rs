//! Device enumeration
//!
//! The SQLite source selects every device that has at least one service and is
//! not disabled, optionally restricted to a set of poller groups.

use crate::devices::DeviceId;
use crate::error::{DeviceSourceError, SourceResult};

use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};

/// Supplies the device ids for one run
pub trait DeviceSource: Send {
    /// All device ids to check
    fn devices(&self) -> SourceResult<Vec<DeviceId>>;

    /// Inclusive id range used for end-of-run lock cleanup
    fn id_range(&self) -> SourceResult<Option<(DeviceId, DeviceId)>> {
        let devices = self.devices()?;
        Ok(devices
            .iter()
            .min()
            .copied()
            .zip(devices.iter().max().copied()))
    }
}

/// Fixed list of devices
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceSource {
    devices: Vec<DeviceId>,
}

impl StaticDeviceSource {
    /// Create a source from a list of ids
    pub fn new(devices: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }
}

impl DeviceSource for StaticDeviceSource {
    fn devices(&self) -> SourceResult<Vec<DeviceId>> {
        Ok(self.devices.clone())
    }
}

/// Devices read from the monitoring database
#[derive(Debug, Clone)]
pub struct SqliteDeviceSource {
    path: PathBuf,
    poller_groups: Vec<i64>,
}

impl SqliteDeviceSource {
    /// Create a source for the database at `path`
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            poller_groups: Vec::new(),
        }
    }

    /// Only return devices in these poller groups
    pub fn with_poller_groups(mut self, groups: Vec<i64>) -> Self {
        self.poller_groups = groups;
        self
    }

    fn open(&self) -> SourceResult<Connection> {
        Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
            DeviceSourceError::Open {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn device_query(&self) -> String {
        let mut sql = String::from(
            "SELECT DISTINCT services.device_id FROM services \
             LEFT JOIN devices ON services.device_id = devices.device_id \
             WHERE devices.disabled = 0",
        );

        if !self.poller_groups.is_empty() {
            let placeholders = vec!["?"; self.poller_groups.len()].join(", ");
            sql.push_str(&format!(" AND devices.poller_group IN ({})", placeholders));
        }

        sql
    }
}

impl DeviceSource for SqliteDeviceSource {
    fn devices(&self) -> SourceResult<Vec<DeviceId>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&self.device_query())?;

        let devices = stmt
            .query_map(params_from_iter(self.poller_groups.iter()), |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        devices.into_iter().map(device_id).collect()
    }

    fn id_range(&self) -> SourceResult<Option<(DeviceId, DeviceId)>> {
        let conn = self.open()?;

        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(device_id), MAX(device_id) FROM services",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        match min.zip(max) {
            Some((min, max)) => Ok(Some((device_id(min)?, device_id(max)?))),
            None => Ok(None),
        }
    }
}

fn device_id(id: i64) -> SourceResult<DeviceId> {
    DeviceId::try_from(id).map_err(|_| DeviceSourceError::InvalidId(id))
}
