//! Inbound viewer feedback: tagged action messages mutating the tree.
//!
//! Every viewer's read task funnels raw text into one queue, so structural
//! mutation is processed strictly one request at a time.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::sensor::{self, Sensor, SensorConfig};

use super::Hub;

#[derive(Debug, Default, Deserialize)]
pub struct SensorData {
    #[serde(default)]
    pub totop: bool,
    #[serde(default)]
    pub groupid: String,
    #[serde(default)]
    pub sensor: SensorConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub column: usize,
    #[serde(default)]
    pub totop: bool,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackMsg {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub id: String,
    pub sensor: Option<SensorData>,
    pub group: Option<GroupData>,
}

impl Hub {
    /// Single feedback processor; structural requests never run concurrently.
    pub async fn process_feedback(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        while let Some(raw) = rx.recv().await {
            if let Err(e) = self.handle_feedback(&raw).await {
                warn!("feedback ignored: {:#}", e);
            }
        }
    }

    pub(crate) async fn handle_feedback(&self, raw: &str) -> Result<()> {
        let msg: FeedbackMsg = serde_json::from_str(raw).context("unparsable feedback message")?;
        debug!("feedback: {:?}", msg);

        let refresh = if let Some(sensor) = &msg.sensor {
            self.modify_sensor(&msg.id, &msg.action, sensor).await
        } else if let Some(group) = &msg.group {
            self.modify_group(&msg.id, &msg.action, group).await
        } else {
            self.handle_settings(&msg.action).await
        };

        if refresh {
            self.conf.write().await.sanitize();
            self.broadcast_snapshot().await;
        }

        Ok(())
    }

    pub(crate) async fn modify_sensor(&self, id: &str, action: &str, data: &SensorData) -> bool {
        if action == "new" {
            let sensor = Sensor::new(data.sensor.clone());
            {
                let mut conf = self.conf.write().await;
                let group_id = (!data.groupid.is_empty()).then_some(data.groupid.as_str());
                conf.add_sensor(Arc::clone(&sensor), group_id).await;
            }
            self.discovery.setup(&sensor).await;
            if !data.sensor.disabled {
                sensor.start(self.updates_tx.clone()).await;
            }
            info!("added sensor '{}'", sensor.display_name().await);
            return true;
        }

        let found = self.conf.read().await.find_sensor_by_id(id);
        let Some((group_id, sensor)) = found else {
            warn!("sensor id '{}' not found", id);
            return false;
        };

        if action == "remove" {
            sensor.stop().await;
            self.conf.write().await.remove_sensor(&sensor);
            info!("removed sensor '{}'", sensor.display_name().await);
            return true;
        }

        // Wholesale replacement of the sensor's configuration. The poller
        // must be stopped before the acquisition identity can change.
        let old = sensor.config_snapshot().await;
        let need_reconfig = old.options.device != data.sensor.options.device
            || old.options.input != data.sensor.options.input;

        sensor.stop().await;
        sensor.replace_config(data.sensor.clone()).await;

        {
            let mut conf = self.conf.write().await;
            if !data.groupid.is_empty() && group_id != data.groupid {
                conf.move_sensor_to_group(&sensor, &group_id, &data.groupid);
            }
            if data.totop {
                conf.move_sensor_to_group_top(&sensor);
            }
        }

        if need_reconfig {
            self.discovery.setup(&sensor).await;
        }
        if !data.sensor.disabled {
            sensor.start(self.updates_tx.clone()).await;
        }

        true
    }

    pub(crate) async fn modify_group(&self, id: &str, action: &str, data: &GroupData) -> bool {
        let mut conf = self.conf.write().await;
        let Some((ci, gi)) = conf.find_group_by_id(id) else {
            warn!("group '{}' not found", id);
            return false;
        };

        if action == "remove" {
            let group = &conf.columns[ci].groups[gi];
            if !group.sensors.is_empty() {
                warn!("not removing group '{}': it still has sensors", group.name);
                return false;
            }
            let name = group.name.clone();
            conf.remove_group(id);
            info!("removed empty group '{}'", name);
            return true;
        }

        let mut modified = false;

        if conf.columns[ci].groups[gi].name != data.name {
            conf.columns[ci].groups[gi].name = data.name.clone();
            modified = true;
        }

        if ci != data.column {
            // Detach from the old column, then append empty columns one at
            // a time until the requested index exists.
            let group = conf.columns[ci].groups.remove(gi);
            conf.ensure_column(data.column);
            conf.columns[data.column].groups.push(group);
            modified = true;
        }

        if data.totop && conf.move_group_to_top(id) {
            modified = true;
        }

        modified
    }

    pub(crate) async fn handle_settings(&self, action: &str) -> bool {
        match action {
            "save" => {
                let doc = self.conf.read().await.to_doc().await;
                match doc.save(&self.config_path).await {
                    Ok(()) => {
                        *self.backup.lock().await = doc;
                        self.send_info("Config saved").await;
                    }
                    Err(e) => {
                        error!("config file save failed: {}", e);
                        self.send_info(&format!("Config file save failed: {}", e)).await;
                    }
                }
                false
            }
            "scan" => match self.rescan().await {
                Ok(()) => {
                    self.send_info("Sensor scan complete").await;
                    true
                }
                Err(e) => {
                    error!("sensor scan failed: {:#}", e);
                    self.send_info(&format!("Sensor scan failed: {}", e)).await;
                    false
                }
            },
            "restore" => {
                self.restore().await;
                self.send_info("Restored last good configuration").await;
                true
            }
            other => {
                error!("undefined feedback action '{}'", other);
                false
            }
        }
    }

    /// Re-run discovery, stop all pollers, carry the server settings over
    /// into the freshly discovered tree, and restart everything.
    async fn rescan(&self) -> Result<()> {
        let (server, sysinfo_poll) = {
            let conf = self.conf.read().await;
            (conf.server.clone(), conf.sysinfo_poll)
        };

        let mut fresh = self.discovery.scan(server).await?;
        fresh.sysinfo_poll = sysinfo_poll;

        self.swap_tree(fresh).await;
        Ok(())
    }

    /// Rebuild the tree from the last saved/loaded document and restart.
    async fn restore(&self) {
        let doc = self.backup.lock().await.clone();
        let fresh = Config::from_doc(&doc);
        for sensor in fresh.all_sensors() {
            self.discovery.setup(&sensor).await;
        }
        self.swap_tree(fresh).await;
    }

    /// Replace the whole tree. Pollers are stopped before the swap and
    /// restarted after it; the write lock itself is held only for the swap.
    async fn swap_tree(&self, fresh: Config) {
        {
            let conf = self.conf.read().await;
            sensor::stop_all(&conf).await;
        }
        {
            let mut conf = self.conf.write().await;
            *conf = fresh;
        }
        {
            let conf = self.conf.read().await;
            sensor::start_all(&conf, &self.updates_tx).await;
        }
    }
}
