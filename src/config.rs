//! Configuration tree (columns -> groups -> sensors) and its JSON
//! persistence. Structural mutation happens only on the hub's feedback path;
//! pollers never touch the tree, only their own sensor's lock.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::sensor::{Sensor, SensorConfig};

/// Discovery stops arranging new columns past this point.
pub const MAX_COLUMNS: usize = 4;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:12345";
pub const DEFAULT_SYSINFO_POLL: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing 'server' section in config file")]
    MissingServer,
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub resources: String,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            resources: String::new(),
        }
    }
}

pub struct Group {
    id: String,
    pub name: String,
    pub sensors: Vec<Arc<Sensor>>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            sensors: Vec::new(),
        }
    }

    /// Run-scoped id used for addressing from viewers; never persisted.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
pub struct Column {
    pub groups: Vec<Group>,
}

pub struct Config {
    pub server: Server,
    pub sysinfo_poll: u64,
    pub columns: Vec<Column>,
}

impl Config {
    pub fn new(server: Server) -> Self {
        Self {
            server,
            sysinfo_poll: DEFAULT_SYSINFO_POLL,
            columns: Vec::new(),
        }
    }

    /// All sensors in column-major, then group-major, then insertion order.
    pub fn all_sensors(&self) -> Vec<Arc<Sensor>> {
        self.columns
            .iter()
            .flat_map(|col| &col.groups)
            .flat_map(|grp| &grp.sensors)
            .cloned()
            .collect()
    }

    /// Find a sensor and the id of its owning group.
    pub fn find_sensor_by_id(&self, id: &str) -> Option<(String, Arc<Sensor>)> {
        for col in &self.columns {
            for grp in &col.groups {
                for sensor in &grp.sensors {
                    if sensor.id() == id {
                        return Some((grp.id.clone(), Arc::clone(sensor)));
                    }
                }
            }
        }
        None
    }

    /// Find a group by id, yielding its column and group indices.
    pub fn find_group_by_id(&self, id: &str) -> Option<(usize, usize)> {
        for (ci, col) in self.columns.iter().enumerate() {
            for (gi, grp) in col.groups.iter().enumerate() {
                if grp.id == id {
                    return Some((ci, gi));
                }
            }
        }
        None
    }

    pub fn add_column(&mut self) {
        self.columns.push(Column::default());
    }

    /// Append empty columns one at a time until `index` is valid. Columns
    /// are created monotonically: a request for column 5 with 2 present
    /// creates columns 2 through 5, never a sparse jump.
    pub fn ensure_column(&mut self, index: usize) {
        while self.columns.len() <= index {
            self.add_column();
        }
    }

    /// Add a group to the given column, clamping an out-of-range index to a
    /// single freshly appended column.
    pub fn add_group(&mut self, mut column: usize, group: Group) {
        if self.columns.len() <= column {
            self.add_column();
            column = self.columns.len() - 1;
        }
        self.columns[column].groups.push(group);
    }

    /// Add a sensor to the named group, or to a fresh group in column 0
    /// when no group is given.
    pub async fn add_sensor(&mut self, sensor: Arc<Sensor>, group_id: Option<&str>) {
        if let Some((ci, gi)) = group_id.and_then(|id| self.find_group_by_id(id)) {
            self.columns[ci].groups[gi].sensors.push(sensor);
            return;
        }

        let mut group = Group::new(sensor.display_name().await);
        group.sensors.push(sensor);
        self.add_group(0, group);
    }

    /// Remove a group from whichever column contains it. The caller is
    /// responsible for checking the group is empty on user-driven removal.
    pub fn remove_group(&mut self, id: &str) {
        if let Some((ci, gi)) = self.find_group_by_id(id) {
            self.columns[ci].groups.remove(gi);
        }
    }

    pub fn remove_sensor(&mut self, sensor: &Arc<Sensor>) {
        for col in &mut self.columns {
            for grp in &mut col.groups {
                if let Some(si) = grp.sensors.iter().position(|s| s.id() == sensor.id()) {
                    grp.sensors.remove(si);
                    return;
                }
            }
        }
    }

    /// Shift a group to index 0 of its column, preserving the relative
    /// order of the others. Returns false when already at top or not found.
    pub fn move_group_to_top(&mut self, id: &str) -> bool {
        match self.find_group_by_id(id) {
            Some((_, 0)) | None => false,
            Some((ci, gi)) => {
                let group = self.columns[ci].groups.remove(gi);
                self.columns[ci].groups.insert(0, group);
                true
            }
        }
    }

    pub fn move_sensor_to_group_top(&mut self, sensor: &Arc<Sensor>) -> bool {
        for col in &mut self.columns {
            for grp in &mut col.groups {
                if let Some(si) = grp.sensors.iter().position(|s| s.id() == sensor.id()) {
                    if si == 0 {
                        return false;
                    }
                    let moved = grp.sensors.remove(si);
                    grp.sensors.insert(0, moved);
                    return true;
                }
            }
        }
        false
    }

    /// Move a sensor between groups: append to the new group first, then
    /// remove from the old one, so the sensor is always referenced from the
    /// tree while the identity-based removal scan runs.
    pub fn move_sensor_to_group(&mut self, sensor: &Arc<Sensor>, old_group_id: &str, new_group_id: &str) {
        let Some((ci, gi)) = self.find_group_by_id(new_group_id) else {
            return;
        };
        self.columns[ci].groups[gi].sensors.push(Arc::clone(sensor));

        if let Some((ci, gi)) = self.find_group_by_id(old_group_id) {
            let sensors = &mut self.columns[ci].groups[gi].sensors;
            if let Some(si) = sensors.iter().position(|s| s.id() == sensor.id()) {
                sensors.remove(si);
            }
        }
    }

    /// Drop columns with no groups left, preserving the order of survivors.
    pub fn sanitize(&mut self) {
        self.columns.retain(|col| !col.groups.is_empty());
    }

    /// Build a live tree from a persisted document, assigning fresh
    /// run-scoped ids to every group and sensor.
    pub fn from_doc(doc: &ConfigDoc) -> Self {
        let mut conf = Self {
            server: doc.server.clone().unwrap_or_default(),
            sysinfo_poll: doc.sysinfo_poll,
            columns: Vec::new(),
        };

        for col_doc in &doc.columns {
            let mut column = Column::default();
            for grp_doc in &col_doc.groups {
                let mut group = Group::new(grp_doc.name.clone());
                for sensor_doc in &grp_doc.sensors {
                    group.sensors.push(Sensor::new(sensor_doc.clone()));
                }
                column.groups.push(group);
            }
            conf.columns.push(column);
        }

        conf
    }

    /// Snapshot the persisted fields of the whole tree. Runtime fields are
    /// never included.
    pub async fn to_doc(&self) -> ConfigDoc {
        let mut columns = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let mut groups = Vec::with_capacity(col.groups.len());
            for grp in &col.groups {
                let mut sensors = Vec::with_capacity(grp.sensors.len());
                for sensor in &grp.sensors {
                    sensors.push(sensor.config_snapshot().await);
                }
                groups.push(GroupDoc {
                    name: grp.name.clone(),
                    sensors,
                });
            }
            columns.push(ColumnDoc { groups });
        }

        ConfigDoc {
            server: Some(self.server.clone()),
            sysinfo_poll: self.sysinfo_poll,
            columns,
        }
    }
}

/// The on-disk JSON shape: `server`, `sysinfo poll`, and the column tree of
/// plain sensor configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDoc {
    pub server: Option<Server>,
    #[serde(default = "default_sysinfo_poll", rename = "sysinfo poll")]
    pub sysinfo_poll: u64,
    #[serde(default)]
    pub columns: Vec<ColumnDoc>,
}

fn default_sysinfo_poll() -> u64 {
    DEFAULT_SYSINFO_POLL
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDoc {
    #[serde(default)]
    pub groups: Vec<GroupDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDoc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl ConfigDoc {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let doc: ConfigDoc = serde_json::from_str(&data)?;
        if doc.server.is_none() {
            return Err(ConfigError::MissingServer);
        }
        Ok(doc)
    }

    /// Save, keeping the previous file as `<path>-`.
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let mut backup = path.as_os_str().to_owned();
            backup.push("-");
            info!("moving config file {:?} to {:?}", path, backup);
            tokio::fs::rename(path, &backup).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        info!("saving config to {:?}", path);
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
