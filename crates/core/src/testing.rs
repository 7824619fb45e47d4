//! In-memory stand-ins for the external seams
//!
//! `FakeAudioControl` keeps a tiny audio graph (devices, client streams,
//! modules) and mimics how the engine reacts to module loads. `ScriptedRunner`
//! replays canned process outputs. `ScriptedCapture` hands out in-memory pipes
//! instead of capture processes.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;

use crate::domain::audio::{
    names, AudioControl, AudioError, ClientStream, DeviceEntry, GatewayStatus, LinkRecord,
    ModuleEntry, ModuleId, RestartOutcome, Result, StreamId,
};
use crate::domain::gateway::{ProcessOutput, ProcessRunner};
use crate::domain::monitor::{CaptureControl, CaptureFormat, CaptureProcess, CaptureSpawner};

#[derive(Default)]
struct FakeGraph {
    sinks: Vec<DeviceEntry>,
    sources: Vec<DeviceEntry>,
    streams: Vec<ClientStream>,
    modules: Vec<ModuleEntry>,
    next_module: u32,
    next_stream: u32,
    default_sink: Option<String>,
    default_source: Option<String>,
    sink_volumes: HashMap<String, u32>,
    sink_mutes: HashMap<String, bool>,
    source_volumes: HashMap<String, u32>,
    stream_volumes: HashMap<StreamId, u32>,
    stream_mutes: HashMap<StreamId, bool>,
}

#[derive(Default)]
struct CallLog {
    loads: Vec<(String, Vec<String>)>,
    unloads: Vec<ModuleId>,
    moves: Vec<(StreamId, String)>,
    restarts: Vec<Vec<String>>,
}

/// In-memory audio graph implementing [`AudioControl`]
pub struct FakeAudioControl {
    graph: Mutex<FakeGraph>,
    calls: Mutex<CallLog>,
    available: AtomicBool,
    restart_outcome: Mutex<RestartOutcome>,
    restart_drops_modules: AtomicBool,
}

impl Default for FakeAudioControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAudioControl {
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(FakeGraph {
                next_module: 100,
                next_stream: 500,
                ..Default::default()
            }),
            calls: Mutex::new(CallLog::default()),
            available: AtomicBool::new(true),
            restart_outcome: Mutex::new(RestartOutcome::Restarted),
            restart_drops_modules: AtomicBool::new(false),
        }
    }

    /// Graph with the rig's channel sinks, two hardware outputs (`hw0`
    /// default, `hw1`) and one hardware input (`usb_mic`)
    pub fn with_rig() -> Self {
        let fake = Self::new();
        let mut index = 1;
        for name in ["hw0", "hw1", "browser", "game", "chat", "soundboard", "stream"] {
            fake.add_sink(DeviceEntry::new(index, name, name));
            index += 1;
        }
        fake.add_sink(DeviceEntry::new(index, names::CHAT_FX_INPUT, "Chat FX Input"));
        fake.add_source(DeviceEntry::new(40, names::CHAT_FX_OUTPUT, "Chat FX Output"));
        fake.add_source(DeviceEntry::new(41, "usb_mic", "USB Microphone"));
        fake.set_defaults(Some("hw0"), Some("usb_mic"));
        fake
    }

    fn graph(&self) -> std::sync::MutexGuard<'_, FakeGraph> {
        self.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self) -> std::sync::MutexGuard<'_, CallLog> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a sink together with its monitor source
    pub fn add_sink(&self, sink: DeviceEntry) {
        let mut graph = self.graph();
        let mut monitor = sink.clone();
        monitor.name = format!("{}{}", sink.name, names::MONITOR_SUFFIX);
        monitor.description = format!("Monitor of {}", sink.description);
        graph.sources.push(monitor);
        graph.sinks.push(sink);
    }

    pub fn add_source(&self, source: DeviceEntry) {
        self.graph().sources.push(source);
    }

    pub fn remove_source(&self, name: &str) {
        self.graph().sources.retain(|s| s.name != name);
    }

    pub fn add_client_stream(&self, stream: ClientStream) {
        self.graph().streams.push(stream);
    }

    /// Add an application stream playing into `sink`
    pub fn add_app_stream(&self, id: u32, app: &str, binary: &str, sink: &str) -> StreamId {
        let stream = ClientStream {
            id: StreamId(id),
            sink: sink.to_string(),
            owner_module: None,
            state: "RUNNING".to_string(),
            app: app.to_string(),
            binary: binary.to_string(),
            media: "Playback".to_string(),
            node_name: format!("{}.node", binary),
            object_id: Some(id),
        };
        self.add_client_stream(stream);
        StreamId(id)
    }

    pub fn set_defaults(&self, sink: Option<&str>, source: Option<&str>) {
        let mut graph = self.graph();
        graph.default_sink = sink.map(str::to_string);
        graph.default_source = source.map(str::to_string);
    }

    /// Simulate the control tool being circuit-broken
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_restart_outcome(&self, outcome: RestartOutcome) {
        *self.restart_outcome.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
    }

    /// Make a restart unload every module, as the real backend does
    pub fn set_restart_drops_modules(&self, drops: bool) {
        self.restart_drops_modules.store(drops, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Create a loopback without logging a call, for test setup
    pub fn load_link(&self, source: &str, sink: &str) -> ModuleId {
        let args = LinkRecord::module_args(source, sink, 20);
        self.graph().load(names::LOOPBACK_MODULE, &args)
    }

    pub fn links(&self) -> Vec<LinkRecord> {
        self.graph()
            .modules
            .iter()
            .filter_map(LinkRecord::from_module)
            .collect()
    }

    pub fn has_link(&self, source: &str, sink: &str) -> bool {
        self.links()
            .iter()
            .any(|l| l.source == source && l.sink == sink)
    }

    pub fn links_from(&self, source: &str) -> Vec<LinkRecord> {
        self.links()
            .into_iter()
            .filter(|l| l.source == source)
            .collect()
    }

    pub fn has_module(&self, id: ModuleId) -> bool {
        self.graph().modules.iter().any(|m| m.id == id)
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.graph().sinks.iter().any(|s| s.name == name)
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.graph().sources.iter().any(|s| s.name == name)
    }

    pub fn stream_sink(&self, id: StreamId) -> Option<String> {
        self.graph()
            .streams
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.sink.clone())
    }

    /// Move a stream without logging a call, as an external mixer would
    pub fn place_stream(&self, id: StreamId, sink: &str) {
        if let Some(stream) = self.graph().streams.iter_mut().find(|s| s.id == id) {
            stream.sink = sink.to_string();
        }
    }

    /// Loopback stream created for a link module
    pub fn stream_of_module(&self, id: ModuleId) -> Option<StreamId> {
        self.graph()
            .streams
            .iter()
            .find(|s| s.owner_module == Some(id))
            .map(|s| s.id)
    }

    pub fn sink_volume(&self, sink: &str) -> Option<u32> {
        self.graph().sink_volumes.get(sink).copied()
    }

    pub fn sink_muted(&self, sink: &str) -> Option<bool> {
        self.graph().sink_mutes.get(sink).copied()
    }

    pub fn source_volume(&self, source: &str) -> Option<u32> {
        self.graph().source_volumes.get(source).copied()
    }

    pub fn stream_volume(&self, id: StreamId) -> Option<u32> {
        self.graph().stream_volumes.get(&id).copied()
    }

    pub fn current_default_sink(&self) -> Option<String> {
        self.graph().default_sink.clone()
    }

    pub fn current_default_source(&self) -> Option<String> {
        self.graph().default_source.clone()
    }

    pub fn load_count(&self) -> usize {
        self.log().loads.len()
    }

    pub fn unload_count(&self) -> usize {
        self.log().unloads.len()
    }

    pub fn loads(&self) -> Vec<(String, Vec<String>)> {
        self.log().loads.clone()
    }

    pub fn moves(&self) -> Vec<(StreamId, String)> {
        self.log().moves.clone()
    }

    pub fn restarts(&self) -> Vec<Vec<String>> {
        self.log().restarts.clone()
    }

    pub fn reset_calls(&self) {
        *self.log() = CallLog::default();
    }
}

impl FakeGraph {
    fn load(&mut self, name: &str, args: &[String]) -> ModuleId {
        let id = ModuleId(self.next_module);
        self.next_module += 1;
        let module = ModuleEntry {
            id,
            name: name.to_string(),
            args: args.join(" "),
        };

        match name {
            names::LOOPBACK_MODULE => {
                let stream_id = StreamId(self.next_stream);
                self.next_stream += 1;
                self.streams.push(ClientStream {
                    id: stream_id,
                    sink: module.arg("sink").unwrap_or_default().to_string(),
                    owner_module: Some(id),
                    state: "RUNNING".to_string(),
                    app: "PipeWire".to_string(),
                    binary: String::new(),
                    media: format!("loopback-{}", id),
                    node_name: String::new(),
                    object_id: None,
                });
            }
            names::NULL_SINK_MODULE => {
                if let Some(sink) = module.arg("sink_name") {
                    let mut entry = DeviceEntry::new(id.0, sink, sink);
                    entry.owner_module = Some(id);
                    let mut monitor = entry.clone();
                    monitor.name = format!("{}{}", sink, names::MONITOR_SUFFIX);
                    self.sources.push(monitor);
                    self.sinks.push(entry);
                }
            }
            names::REMAP_SOURCE_MODULE => {
                if let Some(source) = module.arg("source_name") {
                    let mut entry = DeviceEntry::new(id.0, source, source);
                    entry.owner_module = Some(id);
                    self.sources.push(entry);
                }
            }
            _ => {}
        }

        self.modules.push(module);
        id
    }

    fn unload(&mut self, id: ModuleId) -> bool {
        let before = self.modules.len();
        self.modules.retain(|m| m.id != id);
        self.streams.retain(|s| s.owner_module != Some(id));
        self.sinks.retain(|s| s.owner_module != Some(id));
        self.sources.retain(|s| s.owner_module != Some(id));
        self.modules.len() != before
    }
}

#[async_trait]
impl AudioControl for FakeAudioControl {
    async fn sinks(&self) -> Vec<DeviceEntry> {
        if !self.is_available() {
            return Vec::new();
        }
        self.graph().sinks.clone()
    }

    async fn sources(&self) -> Vec<DeviceEntry> {
        if !self.is_available() {
            return Vec::new();
        }
        self.graph().sources.clone()
    }

    async fn client_streams(&self) -> Vec<ClientStream> {
        if !self.is_available() {
            return Vec::new();
        }
        self.graph().streams.clone()
    }

    async fn modules(&self) -> Vec<ModuleEntry> {
        if !self.is_available() {
            return Vec::new();
        }
        self.graph().modules.clone()
    }

    async fn load_module(&self, name: &str, args: &[String]) -> Option<ModuleId> {
        if !self.is_available() {
            return None;
        }
        self.log().loads.push((name.to_string(), args.to_vec()));
        Some(self.graph().load(name, args))
    }

    async fn unload_module(&self, id: ModuleId) -> bool {
        if !self.is_available() {
            return false;
        }
        self.log().unloads.push(id);
        self.graph().unload(id)
    }

    async fn default_sink(&self) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        self.graph().default_sink.clone()
    }

    async fn default_source(&self) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        self.graph().default_source.clone()
    }

    async fn set_default_sink(&self, sink: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().default_sink = Some(sink.to_string());
        true
    }

    async fn set_default_source(&self, source: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().default_source = Some(source.to_string());
        true
    }

    async fn move_client_stream(&self, id: StreamId, sink: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        self.log().moves.push((id, sink.to_string()));
        let mut graph = self.graph();
        match graph.streams.iter_mut().find(|s| s.id == id) {
            Some(stream) => {
                stream.sink = sink.to_string();
                true
            }
            None => false,
        }
    }

    async fn set_sink_volume(&self, sink: &str, percent: u32) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().sink_volumes.insert(sink.to_string(), percent);
        true
    }

    async fn set_sink_mute(&self, sink: &str, muted: bool) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().sink_mutes.insert(sink.to_string(), muted);
        true
    }

    async fn set_source_volume(&self, source: &str, percent: u32) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().source_volumes.insert(source.to_string(), percent);
        true
    }

    async fn set_client_stream_volume(&self, id: StreamId, percent: u32) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().stream_volumes.insert(id, percent);
        true
    }

    async fn set_client_stream_mute(&self, id: StreamId, muted: bool) -> bool {
        if !self.is_available() {
            return false;
        }
        self.graph().stream_mutes.insert(id, muted);
        true
    }

    async fn restart_backend(&self, units: &[&str]) -> RestartOutcome {
        let outcome = *self.restart_outcome.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.restarted() {
            self.log()
                .restarts
                .push(units.iter().map(|u| u.to_string()).collect());
            if self.restart_drops_modules.load(Ordering::SeqCst) {
                let mut graph = self.graph();
                let ids: Vec<_> = graph.modules.iter().map(|m| m.id).collect();
                for id in ids {
                    graph.unload(id);
                }
            }
        }
        outcome
    }

    fn status(&self) -> GatewayStatus {
        let available = self.is_available();
        GatewayStatus {
            available,
            last_error: if available {
                String::new()
            } else {
                "Connection refused".to_string()
            },
            retry_in_secs: if available { 0 } else { 5 },
            restart_cooldown_secs: 15,
        }
    }
}

/// Replays canned outputs. Queued responses are consumed first, then
/// prefix rules, then an empty success.
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<std::result::Result<ProcessOutput, String>>>,
    rules: Mutex<Vec<(Vec<String>, ProcessOutput)>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: ProcessOutput) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(output));
    }

    /// Next call fails to spawn with `message`
    pub fn push_spawn_error(&self, message: &str) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.to_string()));
    }

    /// Answer every call whose arguments start with `prefix`
    pub fn on(&self, prefix: &[&str], output: ProcessOutput) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.iter().map(|s| s.to_string()).collect(), output));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<ProcessOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((program.to_string(), args.to_vec()));

        if let Some(next) = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return next.map_err(std::io::Error::other);
        }

        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let matched = rules
            .iter()
            .find(|(prefix, _)| args.len() >= prefix.len() && args[..prefix.len()] == prefix[..]);
        Ok(matched
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| ProcessOutput::ok("")))
    }
}

struct ScriptedKill {
    kills: Arc<AtomicUsize>,
}

impl CaptureControl for ScriptedKill {
    fn kill(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture spawner backed by in-memory pipes
#[derive(Default)]
pub struct ScriptedCapture {
    spawned: Mutex<Vec<(String, Option<DuplexStream>)>>,
    kills: Arc<AtomicUsize>,
    failures: AtomicUsize,
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` spawns
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn spawned_targets(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Writing end of the latest capture of `target`. Dropping it ends the
    /// capture.
    pub fn take_writer(&self, target: &str) -> Option<DuplexStream> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter_mut()
            .rev()
            .find(|(t, w)| t == target && w.is_some())
            .and_then(|(_, w)| w.take())
    }
}

impl CaptureSpawner for ScriptedCapture {
    fn spawn(&self, target: &str, _format: &CaptureFormat) -> Result<CaptureProcess> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AudioError::SpawnFailed {
                program: "pw-cat".to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let (reader, writer) = tokio::io::duplex(64 * 1024);
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target.to_string(), Some(writer)));
        Ok(CaptureProcess {
            output: Box::new(reader),
            control: Box::new(ScriptedKill {
                kills: self.kills.clone(),
            }),
        })
    }
}
