//! Audio graph domain model and the `AudioControl` seam
//!
//! This module defines the records the rest of the core reasons about (sinks,
//! sources, client streams, loaded modules, links) and the interface every
//! audio-server adapter must implement. The textual `pactl` adapter lives in
//! the `infra` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// The gated control tool is circuit-broken
    #[error("Audio control tool unavailable (retry in {retry_in:?})")]
    ToolUnavailable { retry_in: Duration },

    /// A subprocess could not be started
    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    /// Error in a capture subprocess
    #[error("Capture error: {0}")]
    CaptureError(String),

    /// Requested device was not found in the live graph
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Unknown channel name
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// The request conflicts with how the rig is wired
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Invalid configuration for a device or link
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Names of the devices and modules the rig declares in the engine.
pub mod names {
    pub const MIC_SINK: &str = "mic";
    pub const STREAM_SINK: &str = "stream";
    pub const CHAT_FX_INPUT: &str = "chat_fx_input";
    pub const CHAT_FX_OUTPUT: &str = "chat_fx_output";
    pub const MIC_SOURCE: &str = "mixrig_mic";
    pub const MIC_FX_SOURCE: &str = "mixrig_micfx";
    pub const MIC_FX_CAPTURE: &str = "mixrig_input";

    pub const MONITOR_SUFFIX: &str = ".monitor";
    pub const METER_SUFFIX: &str = "_meter";

    pub const LOOPBACK_MODULE: &str = "module-loopback";
    pub const NULL_SINK_MODULE: &str = "module-null-sink";
    pub const REMAP_SOURCE_MODULE: &str = "module-remap-source";
}

/// One of the rig's fixed virtual channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Browser,
    Game,
    Chat,
    Soundboard,
    Mic,
    Stream,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Browser,
        Channel::Game,
        Channel::Chat,
        Channel::Soundboard,
        Channel::Mic,
        Channel::Stream,
    ];

    /// Channels that always get a monitor link to the system output
    pub const DEFAULT_LINKED: [Channel; 3] = [Channel::Browser, Channel::Game, Channel::Soundboard];

    /// Channels a client stream may be routed to
    pub const ROUTABLE: [Channel; 5] = [
        Channel::Browser,
        Channel::Game,
        Channel::Chat,
        Channel::Soundboard,
        Channel::Stream,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Browser => "browser",
            Channel::Game => "game",
            Channel::Chat => "chat",
            Channel::Soundboard => "soundboard",
            Channel::Mic => "mic",
            Channel::Stream => "stream",
        }
    }

    /// Name of the virtual sink backing this channel
    pub fn sink_name(&self) -> &'static str {
        self.as_str()
    }

    /// Monitor tap of the channel's sink
    pub fn monitor_source(&self) -> String {
        format!("{}{}", self.as_str(), names::MONITOR_SUFFIX)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AudioError::UnknownChannel(s.to_string()))
    }
}

/// Engine-assigned module index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned client stream index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sink or source as reported by the engine, before any normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub index: u32,
    pub name: String,
    pub description: String,
    pub owner_module: Option<ModuleId>,
    pub state: String,
}

impl DeviceEntry {
    pub fn new(index: u32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            description: description.into(),
            owner_module: None,
            state: String::new(),
        }
    }

    pub fn is_monitor(&self) -> bool {
        self.name.ends_with(names::MONITOR_SUFFIX)
    }
}

/// A loaded engine module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub id: ModuleId,
    pub name: String,
    pub args: String,
}

impl ModuleEntry {
    /// Value of a `key=value` module argument
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.split_whitespace().find_map(|token| {
            let (k, v) = token.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    pub fn is_loopback(&self) -> bool {
        self.name == names::LOOPBACK_MODULE
    }
}

/// One application's live connection to a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStream {
    pub id: StreamId,
    /// Sink name, or the raw sink index when it could not be resolved
    pub sink: String,
    pub owner_module: Option<ModuleId>,
    pub state: String,
    pub app: String,
    pub binary: String,
    pub media: String,
    pub node_name: String,
    pub object_id: Option<u32>,
}

impl ClientStream {
    /// Streams created by loopback modules rather than applications
    pub fn is_loopback(&self) -> bool {
        let media = self.media.to_lowercase();
        let app = self.app.to_lowercase();
        media.starts_with("loopback-") || app.contains("pipewire") || app.contains("loopback")
    }

    /// Stable key grouping every stream of one application binary
    pub fn group_key(&self) -> String {
        format!("{}|{}", self.app, self.binary)
    }
}

/// An active loopback link from a source to a sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkRecord {
    pub source: String,
    pub sink: String,
    pub handle: ModuleId,
    pub latency_msec: Option<u32>,
}

impl LinkRecord {
    /// Interpret a loaded module as a link; `None` for anything but a loopback
    pub fn from_module(module: &ModuleEntry) -> Option<Self> {
        if !module.is_loopback() {
            return None;
        }
        Some(Self {
            source: module.arg("source")?.to_string(),
            sink: module.arg("sink").unwrap_or_default().to_string(),
            handle: module.id,
            latency_msec: module.arg("latency_msec").and_then(|v| v.parse().ok()),
        })
    }

    /// Module arguments that create this link
    pub fn module_args(source: &str, sink: &str, latency_msec: u32) -> Vec<String> {
        vec![
            format!("source={}", source),
            format!("sink={}", sink),
            format!("latency_msec={}", latency_msec),
        ]
    }
}

/// Result of a backend restart request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestartOutcome {
    Restarted,
    /// Rejected because a restart happened within the cooldown
    NotYet { retry_in_secs: u64 },
}

impl RestartOutcome {
    pub fn restarted(&self) -> bool {
        matches!(self, RestartOutcome::Restarted)
    }
}

/// Health of the control tool as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub available: bool,
    pub last_error: String,
    pub retry_in_secs: u64,
    pub restart_cooldown_secs: u64,
}

/// Structured surface of the external audio server.
///
/// Implementations never surface raw process errors: failures become `false`,
/// `None` or empty collections.
#[async_trait]
pub trait AudioControl: Send + Sync {
    async fn sinks(&self) -> Vec<DeviceEntry>;

    async fn sources(&self) -> Vec<DeviceEntry>;

    async fn client_streams(&self) -> Vec<ClientStream>;

    async fn modules(&self) -> Vec<ModuleEntry>;

    /// Load a module; returns the handle assigned by the engine
    async fn load_module(&self, name: &str, args: &[String]) -> Option<ModuleId>;

    async fn unload_module(&self, id: ModuleId) -> bool;

    async fn default_sink(&self) -> Option<String>;

    async fn default_source(&self) -> Option<String>;

    async fn set_default_sink(&self, sink: &str) -> bool;

    async fn set_default_source(&self, source: &str) -> bool;

    async fn move_client_stream(&self, id: StreamId, sink: &str) -> bool;

    async fn set_sink_volume(&self, sink: &str, percent: u32) -> bool;

    async fn set_sink_mute(&self, sink: &str, muted: bool) -> bool;

    async fn set_source_volume(&self, source: &str, percent: u32) -> bool;

    async fn set_client_stream_volume(&self, id: StreamId, percent: u32) -> bool;

    async fn set_client_stream_mute(&self, id: StreamId, muted: bool) -> bool;

    /// Restart backend service units, subject to the restart cooldown
    async fn restart_backend(&self, units: &[&str]) -> RestartOutcome;

    fn status(&self) -> GatewayStatus;
}
