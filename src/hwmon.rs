//! Hwmon discovery: resolving sensors to their current sysfs paths and
//! scanning the whole hwmon class into a fresh configuration tree.
//!
//! Hwmon class indices (`hwmon0`, `hwmon1`, ...) are not stable across
//! reboots, so sensors are persisted by device name and re-resolved on
//! every startup and reconfiguration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{Config, Group, Server, MAX_COLUMNS};
use crate::sensor::{Options, Sensor, SensorConfig, Widget};

pub const HWMON_PATH: &str = "/sys/class/hwmon";

/// Upper bound on hwmon class entries probed during resolution.
const MAX_HWMON_INDEX: u32 = 100;
/// Discovery packs this many groups into a column before moving on.
const GROUPS_PER_COLUMN: usize = 8;

/// Resolves sensors to readable input paths and discovers new ones.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolve the sensor's device to its current sysfs directory and set
    /// the absolute input path. Returns false when the sensor cannot be
    /// resolved; its input path is cleared in that case.
    async fn setup(&self, sensor: &Sensor) -> bool;

    /// Enumerate every available input and arrange the findings into a
    /// fresh configuration tree.
    async fn scan(&self, server: Server) -> Result<Config>;
}

pub struct HwmonDiscovery {
    base: PathBuf,
}

impl HwmonDiscovery {
    pub fn new() -> Self {
        Self::with_base(PathBuf::from(HWMON_PATH))
    }

    /// Rooted at an arbitrary directory instead of the live sysfs tree.
    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    /// Walk hwmon entries in index order until a gap, looking for the one
    /// whose `device` link resolves to the given device name.
    async fn find_device_dir(&self, device: &str) -> Option<PathBuf> {
        for i in 0..MAX_HWMON_INDEX {
            let dir = self.base.join(format!("hwmon{}", i));
            if tokio::fs::metadata(&dir).await.is_err() {
                break;
            }

            match tokio::fs::canonicalize(dir.join("device")).await {
                Ok(target) => {
                    if target.file_name().is_some_and(|n| n == device) {
                        return Some(dir);
                    }
                }
                Err(e) => debug!("no device link under {:?}: {}", dir, e),
            }
        }
        None
    }

    async fn read_value(path: &Path) -> Result<f64> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        text.trim()
            .parse::<f64>()
            .with_context(|| format!("unparsable value in {:?}", path))
    }

    /// Build a sensor configuration for one discovered input file.
    async fn probe_input(&self, dir: &Path, chip: &str, input: &Path) -> Option<SensorConfig> {
        let file_name = input.file_name()?.to_str()?.to_string();
        let prefix = file_name.strip_suffix("_input").unwrap_or(&file_name);

        // A label file gives the human name; the raw prefix is the fallback.
        let label = match tokio::fs::read_to_string(dir.join(format!("{}_label", prefix))).await {
            Ok(text) => text.trim().to_string(),
            Err(_) => prefix.to_string(),
        };

        let units = if prefix.starts_with("fan") {
            "rpm"
        } else if prefix.starts_with("temp") {
            "°C"
        } else if prefix == "capacity" {
            "%"
        } else {
            "units"
        };

        Some(SensorConfig {
            name: format!("{}/{}", chip, label),
            disabled: false,
            options: Options {
                device: String::new(),
                input: file_name,
                ..Options::default()
            },
            widget: Widget {
                units: units.to_string(),
                fractions: 1,
                ..Widget::default()
            },
        })
    }
}

impl Default for HwmonDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for HwmonDiscovery {
    async fn setup(&self, sensor: &Sensor) -> bool {
        let (device, input, min, max, divider) = {
            let st = sensor.state().await;
            let opts = &st.config.options;
            (
                opts.device.clone(),
                opts.input.clone(),
                opts.min,
                opts.max,
                opts.divider,
            )
        };

        if device.is_empty() || input.is_empty() {
            warn!("sensor '{}' has no device/input set", sensor.display_name().await);
            sensor.set_input_path(None).await;
            return false;
        }

        let Some(dir) = self.find_device_dir(&device).await else {
            warn!("device '{}' not found under {:?}", device, self.base);
            sensor.set_input_path(None).await;
            return false;
        };

        // An unconfigured range is seeded from the hwmon-declared limits
        // when the chip publishes them.
        if min == 0.0 && max == 0.0 {
            let divider = if divider == 0.0 { 1.0 } else { divider };
            let prefix = input.strip_suffix("_input").unwrap_or(&input);

            let declared_min = Self::read_value(&dir.join(format!("{}_min", prefix))).await;
            let declared_max = Self::read_value(&dir.join(format!("{}_max", prefix))).await;

            let mut st = sensor.state().await;
            if let Ok(v) = declared_min {
                st.config.options.min = v / divider;
            }
            if let Ok(v) = declared_max {
                st.config.options.max = v / divider;
            }
        }

        sensor.set_input_path(Some(dir.join(&input))).await;
        true
    }

    async fn scan(&self, server: Server) -> Result<Config> {
        let mut conf = Config::new(server);
        let mut found = 0usize;

        for i in 0..MAX_HWMON_INDEX {
            let dir = self.base.join(format!("hwmon{}", i));
            if tokio::fs::metadata(&dir).await.is_err() {
                break;
            }

            let chip = match tokio::fs::read_to_string(dir.join("name")).await {
                Ok(text) => text.trim().to_string(),
                Err(_) => format!("hwmon{}", i),
            };

            let device = match tokio::fs::canonicalize(dir.join("device")).await {
                Ok(target) => match target.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
                Err(e) => {
                    debug!("skipping {:?}, no device link: {}", dir, e);
                    continue;
                }
            };

            let pattern = dir.join("*_input");
            let mut inputs: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
                .context("bad glob pattern")?
                .filter_map(|entry| entry.ok())
                .collect();
            // Battery-style chips expose a plain percentage instead.
            let capacity = dir.join("device").join("capacity");
            if tokio::fs::metadata(&capacity).await.is_ok() {
                inputs.push(capacity);
            }

            for input in inputs {
                let Some(mut config) = self.probe_input(&dir, &chip, &input).await else {
                    continue;
                };
                config.options.device = device.clone();
                // Keep the path relative to the hwmon dir so it survives
                // re-resolution after a reboot.
                if input.ends_with(Path::new("device/capacity")) {
                    config.options.input = "device/capacity".to_string();
                }

                let name = config.name.clone();
                let sensor = Sensor::new(config);
                sensor.set_input_path(Some(input.clone())).await;

                let mut group = Group::new(format!("Group: {}", name));
                group.sensors.push(sensor);

                let column = (found / GROUPS_PER_COLUMN).min(MAX_COLUMNS - 1);
                conf.ensure_column(column);
                conf.add_group(column, group);
                found += 1;
            }
        }

        info!("scan found {} sensors", found);
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FakeTree {
        root: TempDir,
    }

    impl FakeTree {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
            }
        }

        fn base(&self) -> PathBuf {
            self.root.path().join("class").join("hwmon")
        }

        /// Create `hwmonN` with a chip name and a device link to the given
        /// device directory name.
        fn add_chip(&self, index: u32, chip: &str, device: &str) -> PathBuf {
            let dir = self.base().join(format!("hwmon{}", index));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("name"), format!("{}\n", chip)).unwrap();

            let device_dir = self.root.path().join("devices").join(device);
            fs::create_dir_all(&device_dir).unwrap();
            symlink(&device_dir, dir.join("device")).unwrap();
            dir
        }

        fn add_file(&self, dir: &Path, name: &str, contents: &str) {
            fs::write(dir.join(name), contents).unwrap();
        }
    }

    fn sensor_for(device: &str, input: &str, divider: f64) -> Arc<Sensor> {
        Sensor::new(SensorConfig {
            options: Options {
                device: device.to_string(),
                input: input.to_string(),
                min: 0.0,
                max: 0.0,
                divider,
                ..Options::default()
            },
            ..SensorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_setup_resolves_device_and_reads_declared_limits() {
        let tree = FakeTree::new();
        let dir = tree.add_chip(0, "k10temp", "0000:09:00.0");
        tree.add_file(&dir, "temp1_input", "42000\n");
        tree.add_file(&dir, "temp1_min", "0\n");
        tree.add_file(&dir, "temp1_max", "95000\n");

        let discovery = HwmonDiscovery::with_base(tree.base());
        let sensor = sensor_for("0000:09:00.0", "temp1_input", 1000.0);

        assert!(discovery.setup(&sensor).await);

        let st = sensor.state().await;
        assert_eq!(st.input_path, Some(dir.join("temp1_input")));
        assert_eq!(st.config.options.min, 0.0);
        assert_eq!(st.config.options.max, 95.0);
    }

    #[tokio::test]
    async fn test_setup_skips_limits_when_range_already_set() {
        let tree = FakeTree::new();
        let dir = tree.add_chip(0, "k10temp", "0000:09:00.0");
        tree.add_file(&dir, "temp1_input", "42000\n");
        tree.add_file(&dir, "temp1_max", "95000\n");

        let discovery = HwmonDiscovery::with_base(tree.base());
        let sensor = Sensor::new(SensorConfig {
            options: Options {
                device: "0000:09:00.0".to_string(),
                input: "temp1_input".to_string(),
                min: 10.0,
                max: 80.0,
                divider: 1000.0,
                ..Options::default()
            },
            ..SensorConfig::default()
        });

        assert!(discovery.setup(&sensor).await);
        let st = sensor.state().await;
        assert_eq!(st.config.options.min, 10.0);
        assert_eq!(st.config.options.max, 80.0);
    }

    #[tokio::test]
    async fn test_setup_unknown_device_clears_input_path() {
        let tree = FakeTree::new();
        tree.add_chip(0, "k10temp", "0000:09:00.0");

        let discovery = HwmonDiscovery::with_base(tree.base());
        let sensor = sensor_for("0000:ff:00.0", "temp1_input", 1.0);
        sensor.set_input_path(Some(PathBuf::from("/stale/path"))).await;

        assert!(!discovery.setup(&sensor).await);
        assert!(sensor.state().await.input_path.is_none());
    }

    #[tokio::test]
    async fn test_setup_rejects_empty_identity() {
        let tree = FakeTree::new();
        let discovery = HwmonDiscovery::with_base(tree.base());

        let sensor = sensor_for("", "", 1.0);
        assert!(!discovery.setup(&sensor).await);
        assert!(sensor.state().await.input_path.is_none());
    }

    #[tokio::test]
    async fn test_scan_builds_one_group_per_sensor() {
        let tree = FakeTree::new();
        let cpu = tree.add_chip(0, "k10temp", "0000:09:00.0");
        tree.add_file(&cpu, "temp1_input", "42000\n");
        tree.add_file(&cpu, "temp1_label", "Tctl\n");
        let fans = tree.add_chip(1, "nct6798", "nct6798.656");
        tree.add_file(&fans, "fan1_input", "820\n");

        let discovery = HwmonDiscovery::with_base(tree.base());
        let conf = discovery.scan(Server::default()).await.unwrap();

        let sensors = conf.all_sensors();
        assert_eq!(sensors.len(), 2);
        assert_eq!(conf.columns.len(), 1);
        assert_eq!(conf.columns[0].groups.len(), 2);
        assert_eq!(conf.columns[0].groups[0].name, "Group: k10temp/Tctl");
        assert_eq!(conf.columns[0].groups[1].name, "Group: nct6798/fan1");

        let temp = sensors[0].config_snapshot().await;
        assert_eq!(temp.options.device, "0000:09:00.0");
        assert_eq!(temp.options.input, "temp1_input");
        assert_eq!(temp.widget.units, "°C");

        let fan = sensors[1].config_snapshot().await;
        assert_eq!(fan.widget.units, "rpm");

        // Scan results are immediately pollable.
        assert!(sensors[0].state().await.input_path.is_some());
    }

    #[tokio::test]
    async fn test_scan_includes_battery_capacity() {
        let tree = FakeTree::new();
        let bat = tree.add_chip(0, "BAT0", "BAT0");
        let device_dir = tree.root.path().join("devices").join("BAT0");
        fs::write(device_dir.join("capacity"), "87\n").unwrap();

        let discovery = HwmonDiscovery::with_base(tree.base());
        let conf = discovery.scan(Server::default()).await.unwrap();

        let sensors = conf.all_sensors();
        assert_eq!(sensors.len(), 1);
        let config = sensors[0].config_snapshot().await;
        assert_eq!(config.options.input, "device/capacity");
        assert_eq!(config.widget.units, "%");
        assert_eq!(sensors[0].state().await.input_path, Some(bat.join("device/capacity")));
    }

    #[tokio::test]
    async fn test_scan_distributes_columns() {
        let tree = FakeTree::new();
        let chip = tree.add_chip(0, "many", "manydev");
        for i in 1..=10 {
            tree.add_file(&chip, &format!("temp{}_input", i), "1000\n");
        }

        let discovery = HwmonDiscovery::with_base(tree.base());
        let conf = discovery.scan(Server::default()).await.unwrap();

        assert_eq!(conf.all_sensors().len(), 10);
        assert_eq!(conf.columns.len(), 2);
        assert_eq!(conf.columns[0].groups.len(), 8);
        assert_eq!(conf.columns[1].groups.len(), 2);
    }
}
