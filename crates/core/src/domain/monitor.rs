//! Level monitor: one long-lived PCM capture per monitored channel
//!
//! Each capture's output is read by exactly one task which feeds a
//! [`ChannelMeter`]. Target changes kill the old capture synchronously before a
//! new one starts. A capture that exits is restarted after a delay, and its
//! channel reads the floor value meanwhile.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::audio::{Channel, ClientStream, Result};
use crate::domain::inspector::GraphInspector;
use crate::domain::meter::{ChannelMeter, LevelReading};

const READ_BUFFER: usize = 8192;

/// PCM format requested from the capture tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureFormat {
    pub sample_format: String,
    pub rate: u32,
    pub channels: u16,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_format: "f32".to_string(),
            rate: 48_000,
            channels: 2,
        }
    }
}

/// Timing and scope of level monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorPolicy {
    pub channels: Vec<Channel>,
    pub format: CaptureFormat,
    #[serde(with = "crate::domain::config::millis")]
    pub restart_delay: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub retarget_interval: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub feed_interval: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub peak_hold: Duration,
    /// Queue depth per subscriber before it counts as slow
    pub subscriber_buffer: usize,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            channels: Channel::ALL.to_vec(),
            format: CaptureFormat::default(),
            restart_delay: Duration::from_millis(1500),
            retarget_interval: Duration::from_secs(1),
            feed_interval: Duration::from_millis(200),
            peak_hold: Duration::from_secs(1),
            subscriber_buffer: 16,
        }
    }
}

/// Kills a running capture. Must take effect before returning.
pub trait CaptureControl: Send {
    fn kill(&mut self);
}

/// A started capture: its PCM output and a handle to stop it
pub struct CaptureProcess {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn CaptureControl>,
}

/// Starts continuous captures from a target node
pub trait CaptureSpawner: Send + Sync {
    fn spawn(&self, target: &str, format: &CaptureFormat) -> Result<CaptureProcess>;
}

/// Pick the capture target of every channel.
///
/// The mic and stream sinks are read from their monitor. Other channels use
/// the first application stream playing into them, which is more precise than
/// the channel monitor; without one there is nothing to capture.
pub fn resolve_capture_targets(
    channels: &[Channel],
    streams: &[ClientStream],
) -> BTreeMap<Channel, Option<String>> {
    channels
        .iter()
        .map(|&channel| {
            let target = match channel {
                Channel::Mic | Channel::Stream => Some(channel.monitor_source()),
                _ => streams
                    .iter()
                    .find(|s| {
                        s.sink == channel.sink_name()
                            && !s.app.to_lowercase().contains("pipewire")
                            && !s.media.to_lowercase().contains("loopback")
                    })
                    .and_then(|s| {
                        if !s.node_name.is_empty() {
                            Some(s.node_name.clone())
                        } else {
                            s.object_id.map(|id| id.to_string())
                        }
                    }),
            };
            (channel, target)
        })
        .collect()
}

#[derive(Default)]
struct ChannelSlot {
    target: Option<String>,
    reading: LevelReading,
    generation: u64,
    task: Option<JoinHandle<()>>,
    control: Option<Box<dyn CaptureControl>>,
    last_error: Option<String>,
}

impl ChannelSlot {
    fn stop(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.kill();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Inner {
    spawner: Arc<dyn CaptureSpawner>,
    policy: MonitorPolicy,
    slots: Mutex<HashMap<Channel, ChannelSlot>>,
    token: CancellationToken,
}

/// Per-channel monitor state, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub channel: Channel,
    pub target: Option<String>,
    pub running: bool,
    pub last_error: Option<String>,
}

/// Owns every capture process
#[derive(Clone)]
pub struct LevelMonitor {
    inner: Arc<Inner>,
}

impl LevelMonitor {
    pub fn new(spawner: Arc<dyn CaptureSpawner>, policy: MonitorPolicy) -> Self {
        let slots = policy
            .channels
            .iter()
            .map(|&c| (c, ChannelSlot::default()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                spawner,
                policy,
                slots: Mutex::new(slots),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.inner.policy
    }

    /// Point `channel` at `target`. Returns `true` when the capture changed.
    pub fn set_target(&self, channel: Channel, target: Option<String>) -> bool {
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(channel).or_default();
        if slot.target == target && (target.is_none() || slot.task.is_some()) {
            return false;
        }

        debug!(%channel, old = ?slot.target, new = ?target, "Capture target changed");
        slot.stop();
        slot.generation += 1;
        slot.reading = LevelReading::floor();
        slot.target = target.clone();
        slot.last_error = None;

        match target {
            Some(target) => {
                let generation = slot.generation;
                slot.task = Some(tokio::spawn(capture_loop(
                    self.inner.clone(),
                    channel,
                    target,
                    generation,
                )));
            }
            None => slot.last_error = Some("no capture target".to_string()),
        }
        true
    }

    /// Start one capture per channel with a target. Returns how many channels
    /// are being captured.
    pub fn start_all(&self, targets: BTreeMap<Channel, Option<String>>) -> usize {
        let mut capturing = 0;
        for (channel, target) in targets {
            capturing += usize::from(target.is_some());
            self.set_target(channel, target);
        }
        info!(capturing, channels = self.inner.policy.channels.len(), "Level monitors started");
        capturing
    }

    /// Re-resolve capture targets from the live client streams
    pub async fn refresh_targets(&self, inspector: &GraphInspector) {
        let streams = inspector.raw_client_streams().await;
        let targets = resolve_capture_targets(&self.inner.policy.channels, &streams);
        for (channel, target) in targets {
            self.set_target(channel, target);
        }
    }

    pub fn sample_all(&self) -> BTreeMap<Channel, LevelReading> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.inner
            .policy
            .channels
            .iter()
            .map(|c| (*c, slots.get(c).map(|s| s.reading).unwrap_or_default()))
            .collect()
    }

    pub fn snapshot(&self) -> LevelSnapshot {
        LevelSnapshot(
            self.sample_all()
                .into_iter()
                .map(|(c, r)| (c, FeedLevel::from(r)))
                .collect(),
        )
    }

    pub fn status(&self) -> Vec<MonitorStatus> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut status: Vec<_> = slots
            .iter()
            .map(|(channel, slot)| MonitorStatus {
                channel: *channel,
                target: slot.target.clone(),
                running: slot.control.is_some(),
                last_error: slot.last_error.clone(),
            })
            .collect();
        status.sort_by_key(|s| s.channel);
        status
    }

    /// Kill every capture
    pub fn shutdown(&self) {
        self.inner.token.cancel();
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.values_mut() {
            slot.stop();
            slot.reading = LevelReading::floor();
        }
        info!("Level monitors stopped");
    }
}

impl Inner {
    fn is_current(&self, channel: Channel, generation: u64) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&channel)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// Hand the control to the slot. A stale capture is killed instead.
    fn install_control(
        &self,
        channel: Channel,
        generation: u64,
        mut control: Box<dyn CaptureControl>,
    ) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(&channel) {
            Some(slot) if slot.generation == generation => {
                slot.control = Some(control);
                true
            }
            _ => {
                control.kill();
                false
            }
        }
    }

    fn store_reading(&self, channel: Channel, generation: u64, reading: LevelReading) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&channel) {
            if slot.generation == generation {
                slot.reading = reading;
            }
        }
    }

    fn capture_ended(&self, channel: Channel, generation: u64, reason: String) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(&channel) {
            if slot.generation != generation {
                return;
            }
            if let Some(mut control) = slot.control.take() {
                control.kill();
            }
            slot.reading = LevelReading::floor();
            if slot.last_error.as_deref() != Some(reason.as_str()) {
                warn!(%channel, target = ?slot.target, reason = %reason, "Capture ended");
            }
            slot.last_error = Some(reason);
        }
    }
}

async fn capture_loop(inner: Arc<Inner>, channel: Channel, target: String, generation: u64) {
    loop {
        if !inner.is_current(channel, generation) {
            return;
        }

        match inner.spawner.spawn(&target, &inner.policy.format) {
            Ok(CaptureProcess { output, control }) => {
                if !inner.install_control(channel, generation, control) {
                    return;
                }
                debug!(%channel, target = %target, "Capture started");
                let Some(reason) = read_levels(&inner, channel, generation, output).await else {
                    return;
                };
                inner.capture_ended(channel, generation, reason);
            }
            Err(e) => inner.capture_ended(channel, generation, e.to_string()),
        }

        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = tokio::time::sleep(inner.policy.restart_delay) => {}
        }
    }
}

/// Read until the capture ends; `None` on shutdown
async fn read_levels(
    inner: &Inner,
    channel: Channel,
    generation: u64,
    mut output: Box<dyn AsyncRead + Send + Unpin>,
) -> Option<String> {
    let mut meter = ChannelMeter::new(inner.policy.peak_hold);
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return None,
            read = output.read(&mut buf) => match read {
                Ok(0) => return Some("capture exited".to_string()),
                Ok(n) => {
                    let reading = meter.feed(&buf[..n]);
                    inner.store_reading(channel, generation, reading);
                }
                Err(e) => return Some(e.to_string()),
            }
        }
    }
}

/// One channel in the feed schema
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeedLevel {
    pub level: f64,
    /// Whole dB
    pub db: f64,
}

impl From<LevelReading> for FeedLevel {
    fn from(reading: LevelReading) -> Self {
        Self {
            level: reading.level,
            db: reading.db.round(),
        }
    }
}

/// Consolidated levels of every monitored channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LevelSnapshot(pub BTreeMap<Channel, FeedLevel>);

impl LevelSnapshot {
    pub fn get(&self, channel: Channel) -> Option<&FeedLevel> {
        self.0.get(&channel)
    }

    /// `{"browser":{"level":..,"db":..},..}` on one line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Push feed of level snapshots. Subscribers that fall behind are dropped.
#[derive(Debug)]
pub struct LevelFeed {
    subscribers: Mutex<Vec<mpsc::Sender<LevelSnapshot>>>,
    buffer: usize,
}

impl LevelFeed {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<LevelSnapshot> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver to every subscriber without waiting. Returns how many got it.
    pub fn broadcast(&self, snapshot: &LevelSnapshot) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|tx| tx.try_send(snapshot.clone()).is_ok());
        let dropped = before - subscribers.len();
        if dropped > 0 {
            debug!(dropped, "Dropped slow or closed level subscribers");
        }
        subscribers.len()
    }

    /// One feed tick: publish the monitor's snapshot when anyone listens
    pub fn publish(&self, monitor: &LevelMonitor) -> usize {
        if self.subscriber_count() == 0 {
            return 0;
        }
        self.broadcast(&monitor.snapshot())
    }
}

impl Default for LevelFeed {
    fn default() -> Self {
        Self::new(MonitorPolicy::default().subscriber_buffer)
    }
}
