//! Sensor entity: one monitored hwmon input, its transform settings and its
//! cancellable periodic poller task.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::gradient::{Color, Gradient3};

/// Shared update queue feeding the hub; pollers only ever `try_send` into it.
pub type UpdateTx = mpsc::Sender<Arc<Sensor>>;
pub type UpdateRx = mpsc::Receiver<Arc<Sensor>>;

/// Poll intervals below this floor are rejected at start.
pub const MIN_POLL_MS: u64 = 500;
pub const DEFAULT_POLL_MS: u64 = 1000;

/// Acquisition settings, persisted under the sensor's `options` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub divider: f64,
    /// Poll interval in milliseconds.
    #[serde(default)]
    pub poll: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: String::new(),
            input: String::new(),
            min: 0.0,
            max: 0.0,
            divider: 1.0,
            poll: DEFAULT_POLL_MS,
        }
    }
}

/// Presentation settings, persisted under the sensor's `widget` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub fractions: i32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub color0: String,
    #[serde(default)]
    pub colorn: String,
    #[serde(default)]
    pub color100: String,
    #[serde(default)]
    pub colornp: f64,
    /// Render the whole gradient over the gauge instead of a single color.
    #[serde(default, rename = "gradient")]
    pub show_gradient: bool,
}

impl Default for Widget {
    fn default() -> Self {
        Self {
            units: "units".to_string(),
            fractions: 1,
            color: "#FFFFFF".to_string(),
            color0: "#00FF00".to_string(),
            colorn: "#FFFF00".to_string(),
            color100: "#FF0000".to_string(),
            colornp: 50.0,
            show_gradient: false,
        }
    }
}

/// The persisted part of a sensor. Runtime fields live in [`SensorState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub widget: Widget,
}

/// Last transformed reading; never persisted.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    pub value: f64,
    pub percents: f64,
    pub anti_percents: f64,
    pub color: String,
    pub online: bool,
}

/// Everything guarded by the sensor's own lock: configuration, runtime
/// values and the derived transform factors.
pub struct SensorState {
    pub config: SensorConfig,
    pub runtime: Runtime,
    /// Absolute input path resolved by discovery; None until set up.
    pub input_path: Option<PathBuf>,
    fractions_ratio: f64,
    percentier: f64,
    gradient: Option<Gradient3>,
}

impl SensorState {
    fn new(config: SensorConfig) -> Self {
        Self {
            config,
            runtime: Runtime::default(),
            input_path: None,
            fractions_ratio: 1.0,
            percentier: 1.0,
            gradient: None,
        }
    }

    fn display_name(&self) -> String {
        if self.config.name.is_empty() {
            format!("{}/{}", self.config.options.device, self.config.options.input)
        } else {
            self.config.name.clone()
        }
    }

    /// Force invalid settings to safe defaults and derive the transform
    /// factors. Runs on every start so a reconfigured sensor is re-checked.
    fn normalize(&mut self) {
        let name = self.display_name();
        let opts = &mut self.config.options;

        if opts.divider == 0.0 {
            info!("forcing sensor '{}' divider to 1.0", name);
            opts.divider = 1.0;
        }

        if opts.poll < MIN_POLL_MS {
            info!("forcing sensor '{}' poll interval to {} ms", name, DEFAULT_POLL_MS);
            opts.poll = DEFAULT_POLL_MS;
        }

        let widget = &mut self.config.widget;
        if !(0..=8).contains(&widget.fractions) {
            info!("forcing sensor '{}' fractions to 0", name);
            widget.fractions = 0;
        }
        self.fractions_ratio = 10f64.powi(widget.fractions);

        if opts.min >= opts.max {
            opts.max = opts.min + 1.0;
            info!("forcing sensor '{}' min/max to {}/{}", name, opts.min, opts.max);
        }

        self.percentier = (opts.max - opts.min) / 100.0;

        // A single interpolated color is only needed when the widget does not
        // draw the whole gradient itself.
        self.gradient = if widget.show_gradient {
            None
        } else {
            let parse = |s: &str, fallback: Color| Color::parse(s).unwrap_or(fallback);
            Some(Gradient3::new(
                parse(&widget.color0, Color::from_rgb(0x00, 0xFF, 0x00)),
                parse(&widget.colorn, Color::from_rgb(0xFF, 0xFF, 0x00)),
                parse(&widget.color100, Color::from_rgb(0xFF, 0x00, 0x00)),
                widget.colornp,
            ))
        };
    }

    /// Transform one raw reading into display values, widening min/max when
    /// the value falls outside the declared range.
    fn apply_reading(&mut self, raw: f64) {
        let name = self.display_name();
        self.runtime.online = true;

        let opts = &mut self.config.options;
        let mut value = if opts.divider != 1.0 { raw / opts.divider } else { raw };

        value = if self.config.widget.fractions > 0 {
            (value * self.fractions_ratio).round() / self.fractions_ratio
        } else {
            value.round()
        };

        if value > opts.max {
            warn!(
                "max for sensor '{}' is too low (value={}, max={}), adjusting",
                name, value, opts.max
            );
            opts.max = value;
            self.percentier = (opts.max - opts.min) / 100.0;
        }

        if value < opts.min {
            warn!(
                "min for sensor '{}' is too high (value={}, min={}), adjusting",
                name, value, opts.min
            );
            opts.min = value;
            self.percentier = (opts.max - opts.min) / 100.0;
        }

        self.runtime.value = value;
        self.runtime.percents = (value - opts.min) / self.percentier;
        self.runtime.anti_percents = 100.0 - self.runtime.percents;

        if let Some(gradient) = &self.gradient {
            self.runtime.color = gradient.color_at(self.runtime.percents).to_string();
        }

        debug!("sensor '{}' value={} percents={}", name, value, self.runtime.percents);
    }
}

struct PollerCtl {
    active: bool,
    cancel: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<()>>,
}

/// Serializable view of a sensor's current configuration and reading; this
/// is what viewers receive as a fragment.
#[derive(Debug, Clone, Serialize)]
pub struct SensorView {
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub online: bool,
    pub value: f64,
    pub percents: f64,
    pub antipercents: f64,
    pub color: String,
    pub options: Options,
    pub widget: Widget,
}

pub struct Sensor {
    id: String,
    state: Mutex<SensorState>,
    ctl: Mutex<PollerCtl>,
}

impl Sensor {
    pub fn new(config: SensorConfig) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(SensorState::new(config)),
            ctl: Mutex::new(PollerCtl {
                active: false,
                cancel: None,
                done: None,
            }),
        })
    }

    /// Run-scoped id; stable for this process only, never persisted.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn state(&self) -> MutexGuard<'_, SensorState> {
        self.state.lock().await
    }

    pub async fn active(&self) -> bool {
        self.ctl.lock().await.active
    }

    pub async fn display_name(&self) -> String {
        self.state.lock().await.display_name()
    }

    pub async fn config_snapshot(&self) -> SensorConfig {
        self.state.lock().await.config.clone()
    }

    /// Replace the persisted configuration wholesale (viewer-driven edit).
    /// The caller is responsible for stopping/restarting the poller around
    /// any change of the acquisition identity.
    pub async fn replace_config(&self, config: SensorConfig) {
        self.state.lock().await.config = config;
    }

    pub async fn set_input_path(&self, path: Option<PathBuf>) {
        self.state.lock().await.input_path = path;
    }

    pub async fn view(&self) -> SensorView {
        let st = self.state.lock().await;
        SensorView {
            id: self.id.clone(),
            name: st.display_name(),
            disabled: st.config.disabled,
            online: st.runtime.online,
            value: st.runtime.value,
            percents: st.runtime.percents,
            antipercents: st.runtime.anti_percents,
            color: st.runtime.color.clone(),
            options: st.config.options.clone(),
            widget: st.config.widget.clone(),
        }
    }

    /// Validate the configuration and launch the periodic poller. A no-op
    /// with a warning when the poller is already active. The first
    /// acquisition happens immediately, before the first interval elapses.
    pub async fn start(self: &Arc<Self>, updates: UpdateTx) {
        let mut ctl = self.ctl.lock().await;
        if ctl.active {
            warn!("sensor '{}' already running", self.display_name().await);
            return;
        }

        let poll = {
            let mut st = self.state.lock().await;
            st.normalize();
            Duration::from_millis(st.config.options.poll)
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        ctl.active = true;
        ctl.cancel = Some(cancel_tx);
        ctl.done = Some(done_rx);
        drop(ctl);

        let sensor = Arc::clone(self);
        tokio::spawn(async move {
            sensor.poll_loop(poll, cancel_rx, done_tx, updates).await;
        });
    }

    /// Request cancellation and wait until the poller has confirmed
    /// termination. The input handle is guaranteed closed when this returns,
    /// which makes stop-reconfigure-start sequences race-free.
    pub async fn stop(&self) {
        let mut ctl = self.ctl.lock().await;
        if let (Some(cancel), Some(done)) = (ctl.cancel.take(), ctl.done.take()) {
            let _ = cancel.send(());
            let _ = done.await;
        }
        ctl.active = false;
    }

    async fn poll_loop(
        self: Arc<Self>,
        poll: Duration,
        mut cancel_rx: oneshot::Receiver<()>,
        done_tx: oneshot::Sender<()>,
        updates: UpdateTx,
    ) {
        let name = self.display_name().await;
        info!("started sensor '{}'", name);

        let mut input: Option<File> = None;
        let mut ticker = time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                _ = ticker.tick() => self.acquire(&mut input, &updates).await,
            }
        }

        // Release the input handle before confirming termination so a
        // restart never sees the old descriptor.
        drop(input);
        info!("stopped sensor '{}'", name);
        let _ = done_tx.send(());
    }

    async fn acquire(self: &Arc<Self>, input: &mut Option<File>, updates: &UpdateTx) {
        let reading = self.read_input(input).await;

        {
            let mut st = self.state.lock().await;
            match reading {
                Ok(raw) => st.apply_reading(raw),
                Err(e) => {
                    if st.runtime.online {
                        warn!("sensor '{}' went offline: {:#}", st.display_name(), e);
                    }
                    st.runtime.online = false;
                }
            }
        }

        if updates.try_send(Arc::clone(self)).is_err() {
            debug!("updates queue is full, discarding sensor data");
        }
    }

    /// Read the current numeric value from the input source, reopening the
    /// handle when needed and rewinding before each read (these are live
    /// kernel values, not static files). Any failure closes the handle so
    /// the next cycle starts from a clean open.
    async fn read_input(&self, input: &mut Option<File>) -> Result<f64> {
        let path = self
            .state
            .lock()
            .await
            .input_path
            .clone()
            .context("sensor has no resolved input path")?;

        if input.is_none() {
            let fd = File::open(&path)
                .await
                .with_context(|| format!("failed to open {:?}", path))?;
            *input = Some(fd);
        }

        let result = async {
            let fd = input.as_mut().context("input handle missing")?;
            fd.seek(SeekFrom::Start(0)).await?;
            let mut buf = [0u8; 64];
            let n = fd.read(&mut buf).await?;
            let text = std::str::from_utf8(&buf[..n])?.trim();
            text.parse::<f64>()
                .with_context(|| format!("unparsable sensor value '{}'", text))
        }
        .await;

        if result.is_err() {
            *input = None;
        }
        result
    }
}

/// Start pollers for every enabled sensor in the tree.
pub async fn start_all(conf: &Config, updates: &UpdateTx) {
    for sensor in conf.all_sensors() {
        if sensor.state().await.config.disabled {
            info!("skipping disabled sensor '{}'", sensor.display_name().await);
            continue;
        }
        sensor.start(updates.clone()).await;
    }
}

/// Stop every poller, waiting for each rendezvous in turn.
pub async fn stop_all(conf: &Config) {
    for sensor in conf.all_sensors() {
        sensor.stop().await;
    }
}
