//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod filter_chain;
pub mod gateway;
pub mod inspector;
pub mod meter;
pub mod monitor;
pub mod overrides;
pub mod reconciler;
pub mod registry;
pub mod rig;
pub mod scheduler;
pub mod soundboard;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    AudioControl, AudioError, Channel, ClientStream, DeviceEntry, GatewayStatus, LinkRecord,
    ModuleEntry, ModuleId, RestartOutcome, StreamId,
};
pub use config::{
    AuxLinkHandles, ConfigError, ConfigManager, ConfigStore, DaemonConfig, JsonFileStore,
    MemoryStore, PathsConfig, RigState, StateStore, StateWatcher, StreamLinkState, ToolsConfig,
};
pub use filter_chain::{
    map_gate_threshold, render_chat_chain, render_mic_chain, ChatFilterSettings, Descriptor,
    DescriptorKind, DescriptorStore, FilterChain, MicFilterSettings, NoiseSuppressor,
};
pub use gateway::{CommandGateway, CommandOutput, GatewayPolicy, ProcessOutput, ProcessRunner};
pub use inspector::{ClientStreamGroup, DeviceView, GraphInspector, ListMode, SelfIdentity};
pub use meter::{ChannelMeter, FrameAccumulator, LevelReading};
pub use monitor::{
    CaptureControl, CaptureFormat, CaptureProcess, CaptureSpawner, FeedLevel, LevelFeed,
    LevelMonitor, LevelSnapshot, MonitorPolicy, MonitorStatus,
};
pub use overrides::{OverrideEnforcer, RoutingOverrides};
pub use reconciler::{ApplyOptions, LinkPlan, ReconcilePolicy, ReconcileReport, Reconciler};
pub use registry::{LinkPurpose, ResourcePurpose, ResourceRegistry};
pub use rig::{RigService, RigStatus};
pub use scheduler::{
    Debouncer, KeyedSerializer, ObserverGate, ObserverGuard, PeriodicTask, ReentryGuard, Scheduler,
};
pub use soundboard::{SoundboardEvent, SoundboardEventKind, SoundboardQueue};
