//! Configuration and persisted state for Mixrig
//!
//! This module provides:
//! - `DaemonConfig`: tool paths, directories and timing policy (TOML)
//! - `RigState`: the desired state of the rig, persisted as JSON on every mutation
//! - `ConfigStore` seam with file-backed and in-memory stores
//! - Hot-reload of external edits to the state file via a file system watcher

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::audio::ModuleId;
use crate::domain::filter_chain::{ChatFilterSettings, MicFilterSettings};
use crate::domain::gateway::GatewayPolicy;
use crate::domain::inspector::SelfIdentity;
use crate::domain::monitor::MonitorPolicy;
use crate::domain::reconciler::ReconcilePolicy;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn user_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"))
}

/// Where state and engine descriptors live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `state.json`
    pub state_dir: PathBuf,
    /// Drop-in directory of the audio engine (filter chains)
    pub engine_conf_dir: PathBuf,
    /// Drop-in directory of the pulse compatibility server (links, virtual mic)
    pub pulse_conf_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = user_config_dir();
        Self {
            state_dir: base.join("mixrig"),
            engine_conf_dir: base.join("pipewire").join("pipewire.conf.d"),
            pulse_conf_dir: base.join("pipewire").join("pipewire-pulse.conf.d"),
        }
    }
}

/// External programs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub pactl: String,
    pub pw_cat: String,
    /// User runtime directory handed to captures. Unset inherits the
    /// daemon's environment.
    pub runtime_dir: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pactl: "pactl".to_string(),
            pw_cat: "pw-cat".to_string(),
            runtime_dir: None,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewayPolicy,
    pub reconcile: ReconcilePolicy,
    pub monitor: MonitorPolicy,
    pub identity: SelfIdentity,
}

impl DaemonConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.paths.state_dir.join("state.json")
    }
}

/// Manages `~/.config/mixrig/daemon.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("daemon.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// `~/.config/mixrig` on Linux
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("mixrig"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Load the configuration.
    ///
    /// A missing file is created with defaults. A corrupt file is copied to
    /// `daemon.toml.corrupt` and defaults are used.
    #[instrument(skip(self))]
    pub async fn load(&self) -> DaemonConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, writing defaults"
            );
            let config = DaemonConfig::default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default config"
                );
            }
            return config;
        }

        match DaemonConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );
                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }
                DaemonConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &DaemonConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }
}

/// A stream-mode link: `<sink>.monitor` feeding the stream sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamLinkState {
    pub enabled: bool,
    pub handle: Option<ModuleId>,
}

/// Engine handles of links created outside the desired routing map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxLinkHandles {
    pub mic_loopback: Option<ModuleId>,
    pub mic_loopback_source: Option<String>,
    pub soundboard_mic: Option<ModuleId>,
    pub chat_mic: Option<ModuleId>,
    pub chat_fx_feed: Option<ModuleId>,
}

/// Persisted desired state of the rig
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigState {
    /// Desired routing: source → sink
    pub loopbacks: BTreeMap<String, String>,
    /// Stream-mode flags keyed by channel sink name
    pub stream_links: BTreeMap<String, StreamLinkState>,
    pub stream_output_sink: Option<String>,
    /// Client stream key → sink
    pub overrides: BTreeMap<String, String>,
    pub mic_filter: Option<MicFilterSettings>,
    pub chat_filter: Option<ChatFilterSettings>,
    pub soundboard_mic: bool,
    pub chat_mic: bool,
    pub system_output_sink: Option<String>,
    pub system_input_source: Option<String>,
    /// Default source before the FX source was selected
    pub cached_default_source: Option<String>,
    pub aux_links: AuxLinkHandles,
    pub pin: Option<u16>,
    pub lan_enabled: bool,
}

/// Durable persistence of [`RigState`]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the stored state. `Ok(None)` when nothing has been stored yet.
    async fn try_load(&self) -> Result<Option<RigState>>;

    async fn save(&self, state: &RigState) -> Result<()>;

    /// Never fails: missing or unreadable state yields defaults
    async fn load(&self) -> RigState {
        match self.try_load().await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to read state, using defaults");
                RigState::default()
            }
        }
    }
}

/// JSON file store
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn try_load(&self) -> Result<Option<RigState>> {
        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> RigState {
        match self.try_load().await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("State file not found, using defaults");
                RigState::default()
            }
            Err(e @ ConfigError::Json(_)) => {
                warn!(error = %e, "State file is malformed, using defaults");
                let backup_path = self.path.with_extension("json.corrupt");
                if let Err(copy_err) = fs::copy(&self.path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt state"
                    );
                }
                RigState::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to read state, using defaults");
                RigState::default()
            }
        }
    }

    async fn save(&self, state: &RigState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        // Atomic replace
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: std::sync::Mutex<RigState>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RigState) -> Self {
        Self {
            state: std::sync::Mutex::new(state),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of saves performed so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> RigState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn try_load(&self) -> Result<Option<RigState>> {
        Ok(Some(self.stored()))
    }

    async fn save(&self, state: &RigState) -> Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Live rig state, persisted through a [`ConfigStore`] on every mutation
pub struct StateStore {
    store: Arc<dyn ConfigStore>,
    state: Mutex<RigState>,
}

impl StateStore {
    /// Load the persisted state from `store`
    pub async fn open(store: Arc<dyn ConfigStore>) -> Self {
        let state = store.load().await;
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> RigState {
        self.state.lock().await.clone()
    }

    /// Mutate the state and persist it. A failed save is logged; the
    /// in-memory state stays authoritative.
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut RigState) -> R,
    {
        let mut state = self.state.lock().await;
        let result = f(&mut state);
        if let Err(e) = self.store.save(&state).await {
            warn!(error = %e, "Failed to persist rig state");
        }
        result
    }

    /// Re-read the backing store. Returns `true` when its content differs
    /// from the in-memory state, which is then replaced. A missing or
    /// unparseable store keeps the current state.
    pub async fn reload(&self) -> bool {
        let loaded = match self.store.try_load().await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                debug!("State file gone, keeping current state");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable state file, keeping current state");
                return false;
            }
        };
        let mut state = self.state.lock().await;
        if *state == loaded {
            return false;
        }
        info!("Rig state changed on disk, reloading");
        *state = loaded;
        true
    }
}

/// Watches the state file for edits made outside the daemon
pub struct StateWatcher {
    _watcher: notify::RecommendedWatcher,
    changes_tx: broadcast::Sender<PathBuf>,
}

impl StateWatcher {
    /// Watch `state_path`. The parent directory is watched so atomic
    /// replacements of the file are seen.
    pub async fn new(state_path: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let dir = state_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::Invalid("State path has no parent".to_string()))?;
        fs::create_dir_all(&dir).await?;

        let file_name = state_path.file_name().map(|n| n.to_os_string());
        let (changes_tx, _changes_rx) = broadcast::channel(32);

        let tx = changes_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if !matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_)
            ) {
                return;
            }
            for path in event.paths {
                if path.file_name().map(|n| n.to_os_string()) == file_name {
                    // No receivers is fine
                    let _ = tx.send(path);
                }
            }
        })?;

        watcher.watch(&dir, notify::RecursiveMode::NonRecursive)?;
        info!(path = %state_path.display(), "State watcher started");

        Ok(Self {
            _watcher: watcher,
            changes_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.changes_tx.subscribe()
    }
}
