//! Registry of resources the rig itself creates
//!
//! Every virtual device the rig declares and every module it loads is
//! recorded here with its purpose. Presentation filters consult the registry
//! instead of guessing from names.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::trace;

use crate::domain::audio::{names, Channel, ModuleId};

/// Why a loaded link module exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPurpose {
    /// Channel monitor to an output sink (the desired routing state)
    ChannelOutput,
    /// Physical or FX input into the virtual mic
    MicInput,
    SoundboardMic,
    ChatMic,
    /// Chat monitor into the chat filter chain
    ChatFxFeed,
    /// Channel monitor into the stream sink
    StreamMode,
    /// Stream monitor to an output sink
    StreamOutput,
    /// Virtual mic sink or source module
    VirtualDevice,
}

/// Why a device exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePurpose {
    ChannelSink(Channel),
    MicSource,
    MicFxSource,
    MicFxCapture,
    ChatFxInput,
    ChatFxOutput,
    Meter(Channel),
}

/// Owned-resource registry
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    devices: RwLock<HashMap<String, ResourcePurpose>>,
    modules: RwLock<HashMap<ModuleId, LinkPurpose>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every device the rig declares
    pub fn with_rig_devices() -> Self {
        let registry = Self::new();
        for channel in Channel::ALL {
            registry.register_device(channel.sink_name(), ResourcePurpose::ChannelSink(channel));
            registry.register_device(
                &format!("{}{}", channel.as_str(), names::METER_SUFFIX),
                ResourcePurpose::Meter(channel),
            );
        }
        registry.register_device(names::MIC_SOURCE, ResourcePurpose::MicSource);
        registry.register_device(names::MIC_FX_SOURCE, ResourcePurpose::MicFxSource);
        registry.register_device(names::MIC_FX_CAPTURE, ResourcePurpose::MicFxCapture);
        registry.register_device(names::CHAT_FX_INPUT, ResourcePurpose::ChatFxInput);
        registry.register_device(names::CHAT_FX_OUTPUT, ResourcePurpose::ChatFxOutput);
        registry
    }

    pub fn register_device(&self, name: &str, purpose: ResourcePurpose) {
        trace!(name, ?purpose, "Registering owned device");
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), purpose);
    }

    pub fn device_purpose(&self, name: &str) -> Option<ResourcePurpose> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    /// Whether `name` is one of ours. Monitor taps of owned sinks count too.
    pub fn owns_device(&self, name: &str) -> bool {
        let base = name.strip_suffix(names::MONITOR_SUFFIX).unwrap_or(name);
        self.device_purpose(base).is_some()
    }

    pub fn register_module(&self, id: ModuleId, purpose: LinkPurpose) {
        trace!(%id, ?purpose, "Registering owned module");
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, purpose);
    }

    pub fn forget_module(&self, id: ModuleId) -> Option<LinkPurpose> {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    pub fn module_purpose(&self, id: ModuleId) -> Option<LinkPurpose> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .copied()
    }

    pub fn owns_module(&self, id: ModuleId) -> bool {
        self.module_purpose(id).is_some()
    }

    /// Drop every module record; used after a backend restart unloads them all
    pub fn forget_all_modules(&self) {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rig_devices_are_owned() {
        let registry = ResourceRegistry::with_rig_devices();
        assert!(registry.owns_device("browser"));
        assert!(registry.owns_device("browser.monitor"));
        assert!(registry.owns_device("game_meter"));
        assert!(registry.owns_device(names::CHAT_FX_OUTPUT));
        assert!(registry.owns_device(names::MIC_FX_SOURCE));
        assert!(!registry.owns_device("alsa_output.pci-0000_00_1f.3.analog-stereo"));
        assert_eq!(
            registry.device_purpose("chat"),
            Some(ResourcePurpose::ChannelSink(Channel::Chat))
        );
    }

    #[test]
    fn test_module_lifecycle() {
        let registry = ResourceRegistry::new();
        registry.register_module(ModuleId(7), LinkPurpose::ChatMic);
        assert!(registry.owns_module(ModuleId(7)));
        assert_eq!(registry.forget_module(ModuleId(7)), Some(LinkPurpose::ChatMic));
        assert!(!registry.owns_module(ModuleId(7)));
    }
}
