//! Event broadcast hub: websocket accept loop, per-viewer bounded queues,
//! and the central dispatcher fanning sensor updates out to every viewer.

pub mod feedback;
pub mod sysinfo;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigDoc};
use crate::hwmon::Discovery;
use crate::sensor::{SensorView, UpdateRx, UpdateTx};

/// Capacity of the shared inbound queue fed by pollers and broadcasts.
const INBOUND_QUEUE: usize = 32;
/// Capacity of each viewer's outbound queue.
const VIEWER_QUEUE: usize = 16;
/// Capacity of the raw sensor update queue (pollers -> renderer).
pub const UPDATE_QUEUE: usize = 64;

/// Wire shape of every outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientMsg {
    pub target: String,
    pub data: String,
}

/// Delivery class: fragments are droppable per viewer, snapshots are not.
#[derive(Debug, Clone)]
pub enum Outbound {
    Fragment(String),
    Snapshot(String),
}

#[derive(Debug, Serialize)]
struct GroupView {
    id: String,
    name: String,
    sensors: Vec<SensorView>,
}

#[derive(Debug, Serialize)]
struct ColumnView {
    groups: Vec<GroupView>,
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    host: String,
    columns: Vec<ColumnView>,
}

fn to_client(target: &str, data: String) -> String {
    serde_json::to_string(&ToClientMsg {
        target: target.to_string(),
        data,
    })
    .unwrap_or_default()
}

pub struct Hub {
    pub(crate) conf: Arc<RwLock<Config>>,
    pub(crate) backup: Mutex<ConfigDoc>,
    pub(crate) config_path: PathBuf,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) updates_tx: UpdateTx,
    inbound_tx: mpsc::Sender<Outbound>,
    feedback_tx: mpsc::Sender<String>,
    viewers: Mutex<HashMap<String, mpsc::Sender<String>>>,
    host_name: String,
}

impl Hub {
    /// Build the hub plus the receiving ends of its two internal queues:
    /// the outbound dispatch queue and the serialized feedback queue.
    pub fn new(
        conf: Config,
        backup: ConfigDoc,
        config_path: PathBuf,
        discovery: Arc<dyn Discovery>,
        updates_tx: UpdateTx,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>, mpsc::Receiver<String>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (feedback_tx, feedback_rx) = mpsc::channel(INBOUND_QUEUE);

        let host_name = hostname::get()
            .map(|h| h.to_string_lossy().to_uppercase())
            .unwrap_or_else(|_| "(unknown)".to_string());

        let hub = Arc::new(Self {
            conf: Arc::new(RwLock::new(conf)),
            backup: Mutex::new(backup),
            config_path,
            discovery,
            updates_tx,
            inbound_tx,
            feedback_tx,
            viewers: Mutex::new(HashMap::new()),
            host_name,
        });

        (hub, inbound_rx, feedback_rx)
    }

    /// Accept viewer connections; only the initial bind is fatal.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let listen = self.conf.read().await.server.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {}", listen))?;
        info!("listening at {}", listen);
        self.accept_loop(listener).await
    }

    pub(crate) async fn accept_loop(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            // A transient accept failure must not take the server down.
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream, addr).await {
                    warn!("viewer {} failed: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .context("websocket handshake failed")?;
        info!("viewer connected: {}", addr);

        let (mut sink, mut reader) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(VIEWER_QUEUE);

        // Dedicated write task: the only place this connection's socket is
        // written, draining the viewer's bounded queue.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg)).await {
                    debug!("viewer write failed: {}", e);
                    break;
                }
            }
        });

        // The initial full snapshot is queued before the viewer becomes
        // visible to the dispatcher, so no fragment can precede it.
        let snapshot = self.snapshot_message().await?;
        let _ = tx.send(snapshot).await;
        self.register(addr.to_string(), tx.clone()).await;

        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    // Garbage costs the sender its connection; everything
                    // parsable funnels through the one feedback queue.
                    if serde_json::from_str::<feedback::FeedbackMsg>(&text).is_err() {
                        warn!("viewer {} sent a malformed message, closing", addr);
                        break;
                    }
                    if self.feedback_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("viewer {} transport error: {}", addr, e);
                    break;
                }
            }
        }

        info!("viewer disconnected: {}", addr);
        self.unregister(&addr.to_string()).await;
        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    pub(crate) async fn register(&self, id: String, tx: mpsc::Sender<String>) {
        self.viewers.lock().await.insert(id, tx);
    }

    pub(crate) async fn unregister(&self, id: &str) {
        self.viewers.lock().await.remove(id);
    }

    /// Central dispatcher: drains the inbound queue and replicates each
    /// message to every registered viewer. Fragments use a non-blocking
    /// send and are silently dropped per full viewer queue; snapshots are
    /// handed to a detached task per viewer that blocks until delivered,
    /// so neither the dispatcher nor the registry lock ever stalls.
    pub async fn dispatch(self: Arc<Self>, mut inbound: mpsc::Receiver<Outbound>) {
        while let Some(msg) = inbound.recv().await {
            let targets: Vec<(String, mpsc::Sender<String>)> = {
                let viewers = self.viewers.lock().await;
                viewers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            };

            match msg {
                Outbound::Fragment(data) => {
                    for (id, tx) in targets {
                        if tx.try_send(data.clone()).is_err() {
                            debug!("viewer {} queue is full, dropping fragment", id);
                        }
                    }
                }
                Outbound::Snapshot(data) => {
                    for (id, tx) in targets {
                        let data = data.clone();
                        tokio::spawn(async move {
                            if tx.send(data).await.is_err() {
                                debug!("viewer {} gone, snapshot not delivered", id);
                            }
                        });
                    }
                }
            }
        }
    }

    /// Drain raw sensor updates, render each sensor's fragment, and push it
    /// onto the inbound queue; a saturated queue drops the fragment.
    pub async fn render_updates(self: Arc<Self>, mut updates: UpdateRx) {
        while let Some(sensor) = updates.recv().await {
            let view = sensor.view().await;
            let data = match serde_json::to_string(&view) {
                Ok(data) => data,
                Err(e) => {
                    warn!("rendering sensor '{}' failed: {}", view.name, e);
                    continue;
                }
            };

            let msg = to_client(sensor.id(), data);
            if self.inbound_tx.try_send(Outbound::Fragment(msg)).is_err() {
                debug!("hub queue is full, discarding sensor data");
            }
        }
    }

    /// Droppable informational message for all viewers.
    pub(crate) async fn send_info(&self, text: &str) {
        let msg = to_client("info", text.to_string());
        if self.inbound_tx.try_send(Outbound::Fragment(msg)).is_err() {
            warn!("hub queue is full, discarding info message");
        }
    }

    pub(crate) fn try_send_fragment(&self, target: &str, data: String) {
        let msg = to_client(target, data);
        if self.inbound_tx.try_send(Outbound::Fragment(msg)).is_err() {
            debug!("hub queue is full, discarding {} message", target);
        }
    }

    /// Rebuild the full-state snapshot and queue it for every viewer.
    /// Unlike fragments this send blocks until the inbound queue accepts it.
    pub(crate) async fn broadcast_snapshot(&self) {
        match self.snapshot_message().await {
            Ok(msg) => {
                let _ = self.inbound_tx.send(Outbound::Snapshot(msg)).await;
            }
            Err(e) => warn!("building snapshot failed: {:#}", e),
        }
    }

    /// Stop every poller and wait for each to confirm termination.
    pub async fn shutdown(&self) {
        let conf = self.conf.read().await;
        crate::sensor::stop_all(&conf).await;
    }

    pub(crate) async fn snapshot_message(&self) -> Result<String> {
        let conf = self.conf.read().await;
        let mut columns = Vec::with_capacity(conf.columns.len());
        for col in &conf.columns {
            let mut groups = Vec::with_capacity(col.groups.len());
            for grp in &col.groups {
                let mut sensors = Vec::with_capacity(grp.sensors.len());
                for sensor in &grp.sensors {
                    sensors.push(sensor.view().await);
                }
                groups.push(GroupView {
                    id: grp.id().to_string(),
                    name: grp.name.clone(),
                    sensors,
                });
            }
            columns.push(ColumnView { groups });
        }
        drop(conf);

        let snapshot = SnapshotView {
            host: self.host_name.clone(),
            columns,
        };
        let data = serde_json::to_string(&snapshot).context("serializing snapshot")?;
        Ok(to_client("main", data))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_hub;
    use super::*;
    use crate::config::Server;
    use crate::sensor::{Sensor, SensorConfig};
    use std::time::Duration;

    fn empty_conf() -> Config {
        Config::new(Server::default())
    }

    #[tokio::test]
    async fn test_fragments_drop_on_full_viewer_queue_but_snapshots_arrive() {
        let (hub, inbound_rx, _feedback_rx, _updates_rx) =
            test_hub(empty_conf(), PathBuf::from("/tmp/unused.conf"));

        // A viewer whose queue is already saturated.
        let (tx, mut rx) = mpsc::channel::<String>(1);
        tx.try_send("filler".to_string()).unwrap();
        hub.register("viewer-1".to_string(), tx).await;

        let dispatcher = tokio::spawn(Arc::clone(&hub).dispatch(inbound_rx));

        for i in 0..3 {
            hub.try_send_fragment("sensor-id", format!("fragment-{}", i));
        }
        hub.broadcast_snapshot().await;

        // The filler is still first in the queue; all three fragments were
        // dropped, and the snapshot is delivered once space frees up.
        let first = rx.recv().await.unwrap();
        assert_eq!(first, "filler");

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("snapshot must arrive")
            .unwrap();
        let msg: ToClientMsg = serde_json::from_str(&second).unwrap();
        assert_eq!(msg.target, "main");

        assert!(rx.try_recv().is_err());
        drop(dispatcher);
    }

    #[tokio::test]
    async fn test_render_updates_emits_sensor_fragment() {
        let (hub, mut inbound_rx, _feedback_rx, updates_rx) =
            test_hub(empty_conf(), PathBuf::from("/tmp/unused.conf"));

        let sensor = Sensor::new(SensorConfig {
            name: "cpu temp".to_string(),
            ..SensorConfig::default()
        });
        let id = sensor.id().to_string();

        let renderer = tokio::spawn(Arc::clone(&hub).render_updates(updates_rx));
        hub.updates_tx.send(sensor).await.unwrap();

        let out = inbound_rx.recv().await.unwrap();
        let Outbound::Fragment(raw) = out else {
            panic!("expected a fragment");
        };
        let msg: ToClientMsg = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.target, id);

        let view: serde_json::Value = serde_json::from_str(&msg.data).unwrap();
        assert_eq!(view["name"], "cpu temp");
        assert_eq!(view["online"], false);
        drop(renderer);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_tree_structure() {
        let mut conf = empty_conf();
        let mut group = crate::config::Group::new("thermals");
        group.sensors.push(Sensor::new(SensorConfig {
            name: "cpu".to_string(),
            ..SensorConfig::default()
        }));
        conf.add_group(0, group);

        let (hub, _inbound_rx, _feedback_rx, _updates_rx) =
            test_hub(conf, PathBuf::from("/tmp/unused.conf"));

        let raw = hub.snapshot_message().await.unwrap();
        let msg: ToClientMsg = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.target, "main");

        let snapshot: serde_json::Value = serde_json::from_str(&msg.data).unwrap();
        assert_eq!(snapshot["columns"][0]["groups"][0]["name"], "thermals");
        assert_eq!(
            snapshot["columns"][0]["groups"][0]["sensors"][0]["name"],
            "cpu"
        );
    }

    /// Full hub on an ephemeral port, with dispatcher and feedback tasks.
    async fn live_server(conf: Config) -> (Arc<Hub>, SocketAddr) {
        let (hub, inbound_rx, feedback_rx, _updates_rx) =
            test_hub(conf, PathBuf::from("/tmp/unused.conf"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(Arc::clone(&hub).dispatch(inbound_rx));
        tokio::spawn(Arc::clone(&hub).process_feedback(feedback_rx));
        let acceptor = Arc::clone(&hub);
        tokio::spawn(async move {
            let _ = acceptor.accept_loop(listener).await;
        });
        (hub, addr)
    }

    #[tokio::test]
    async fn test_malformed_viewer_message_closes_only_that_connection() {
        let (hub, addr) = live_server(empty_conf()).await;
        let url = format!("ws://{}", addr);

        let (mut bad, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut good, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        // Both viewers get their snapshot first.
        assert!(matches!(bad.next().await, Some(Ok(Message::Text(_)))));
        assert!(matches!(good.next().await, Some(Ok(Message::Text(_)))));

        bad.send(Message::Text("not json at all".to_string()))
            .await
            .unwrap();

        // The offender's connection is torn down.
        let end = tokio::time::timeout(Duration::from_secs(1), bad.next())
            .await
            .expect("offender must be disconnected");
        assert!(!matches!(end, Some(Ok(Message::Text(_)))));

        // A parsable message with an unknown action is not a teardown.
        good.send(Message::Text(r#"{"action":"noop","id":""}"#.to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.viewers.lock().await.len(), 1);

        hub.try_send_fragment("sensor-id", "data".to_string());
        let served = tokio::time::timeout(Duration::from_secs(1), good.next())
            .await
            .expect("surviving viewer must still be served")
            .unwrap()
            .unwrap();
        let Message::Text(raw) = served else {
            panic!("expected a text message");
        };
        let msg: ToClientMsg = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg.target, "sensor-id");

        // The accept loop keeps taking new viewers afterwards.
        let (mut late, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        assert!(matches!(late.next().await, Some(Ok(Message::Text(_)))));
    }

    #[tokio::test]
    async fn test_first_message_to_viewer_is_the_snapshot() {
        let (hub, addr) = live_server(empty_conf()).await;

        // Fragment noise flowing the whole time viewers connect.
        let noise = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move {
                loop {
                    hub.try_send_fragment("noise", "x".to_string());
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        for _ in 0..5 {
            let (mut viewer, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
                .await
                .unwrap();
            let first = tokio::time::timeout(Duration::from_secs(1), viewer.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let Message::Text(raw) = first else {
                panic!("expected a text message");
            };
            let msg: ToClientMsg = serde_json::from_str(&raw).unwrap();
            assert_eq!(msg.target, "main");
        }
        noise.abort();
    }

    #[tokio::test]
    async fn test_serve_fails_fast_on_unbindable_address() {
        let mut conf = empty_conf();
        conf.server.listen = "definitely-not-an-address".to_string();
        let (hub, _i, _f, _u) = test_hub(conf, PathBuf::from("/tmp/unused.conf"));
        assert!(hub.serve().await.is_err());
    }
}
