//! Virtual microphone: the `mic` sink, its remap source and the links into it

use tracing::{debug, info, warn};

use super::{Reconciler, MIC_LINKS};
use crate::domain::audio::{names, Channel, ModuleId};
use crate::domain::filter_chain::{mic_sink_args, mic_source_args, render_mic_sink, render_mic_source};
use crate::domain::registry::LinkPurpose;

/// Sources whose `→mic` links are managed by their own toggles and are left
/// alone when the physical input link changes
pub const MIC_AUX_SOURCES: [&str; 3] = ["soundboard.monitor", "chat.monitor", names::CHAT_FX_OUTPUT];

fn is_aux_source(source: &str) -> bool {
    MIC_AUX_SOURCES.contains(&source)
}

impl Reconciler {
    /// Make sure the `mic` null sink exists
    pub async fn ensure_mic_sink(&self) -> bool {
        if let Err(e) = self.descriptors.commit_if_absent(&render_mic_sink()).await {
            warn!(error = %e, "Failed to write mic sink descriptor");
        }
        let sinks = self.control.sinks().await;
        if let Some(existing) = sinks.iter().find(|s| s.name == names::MIC_SINK) {
            if let Some(owner) = existing.owner_module {
                self.registry.register_module(owner, LinkPurpose::VirtualDevice);
            }
            return true;
        }
        match self
            .control
            .load_module(names::NULL_SINK_MODULE, &mic_sink_args())
            .await
        {
            Some(id) => {
                info!(handle = %id, "Virtual mic sink created");
                self.registry.register_module(id, LinkPurpose::VirtualDevice);
                true
            }
            None => {
                warn!("Failed to create virtual mic sink");
                false
            }
        }
    }

    /// Make sure the recordable remap source over `mic.monitor` exists
    pub async fn ensure_mic_source(&self) -> bool {
        if let Err(e) = self.descriptors.commit_if_absent(&render_mic_source()).await {
            warn!(error = %e, "Failed to write mic source descriptor");
        }
        let sources = self.control.sources().await;
        if let Some(existing) = sources.iter().find(|s| s.name == names::MIC_SOURCE) {
            if let Some(owner) = existing.owner_module {
                self.registry.register_module(owner, LinkPurpose::VirtualDevice);
            }
            return true;
        }
        match self
            .control
            .load_module(names::REMAP_SOURCE_MODULE, &mic_source_args())
            .await
        {
            Some(id) => {
                info!(handle = %id, "Virtual mic source created");
                self.registry.register_module(id, LinkPurpose::VirtualDevice);
                true
            }
            None => {
                warn!("Failed to create virtual mic source");
                false
            }
        }
    }

    pub async fn ensure_virtual_mic(&self) -> bool {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        let sink = self.ensure_mic_sink().await;
        let source = self.ensure_mic_source().await;
        sink && source
    }

    /// The input that should feed the virtual mic: the FX source when mic
    /// effects are on and it exists, else the chosen or default input.
    /// Monitors and the virtual mic itself never qualify.
    pub async fn resolve_mic_source(&self) -> Option<String> {
        let state = self.state.snapshot().await;
        let fx_active = state
            .mic_filter
            .as_ref()
            .map(|m| m.is_active())
            .unwrap_or(false);
        if fx_active
            && self
                .inspector
                .live_source_names()
                .await
                .contains(names::MIC_FX_SOURCE)
        {
            return Some(names::MIC_FX_SOURCE.to_string());
        }

        let candidate = match state.system_input_source.filter(|s| !s.is_empty()) {
            Some(source) => Some(source),
            None => self.control.default_source().await,
        };
        candidate.filter(|s| {
            !s.is_empty() && !s.ends_with(names::MONITOR_SUFFIX) && s != names::MIC_SOURCE
        })
    }

    /// Link `source` into the virtual mic, replacing any other input link
    pub async fn apply_mic_loopback(&self, source: Option<String>) -> Option<ModuleId> {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        self.mic_loopback(source).await
    }

    async fn mic_loopback(&self, source: Option<String>) -> Option<ModuleId> {
        let keep = source.clone();
        self.remove_links(|l| {
            l.sink == names::MIC_SINK
                && !is_aux_source(&l.source)
                && keep.as_deref() != Some(l.source.as_str())
        })
        .await;

        let Some(source) = source else {
            debug!("No mic input source, mic loopback cleared");
            self.state
                .update(|s| {
                    s.aux_links.mic_loopback = None;
                    s.aux_links.mic_loopback_source = None;
                })
                .await;
            return None;
        };

        let retries = self.policy.mic_link_retries;
        let mut handle = None;
        for attempt in 0..=retries {
            handle = self
                .ensure_link(
                    &source,
                    names::MIC_SINK,
                    self.policy.mic_latency_msec,
                    LinkPurpose::MicInput,
                )
                .await;
            if handle.is_some() {
                break;
            }
            if attempt < retries {
                warn!(source = %source, attempt = attempt + 1, "Mic loopback failed, retrying");
                tokio::time::sleep(self.policy.mic_link_retry_delay).await;
            }
        }

        self.state
            .update(|s| {
                s.aux_links.mic_loopback = handle;
                s.aux_links.mic_loopback_source = handle.map(|_| source.clone());
            })
            .await;
        handle
    }

    /// Remove every physical input link into the virtual mic
    pub async fn clear_mic_loopback(&self) {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        self.mic_loopback(None).await;
    }

    /// Toggle the soundboard→mic link and persist the choice
    pub async fn apply_soundboard_mic(&self, enabled: bool) -> Option<ModuleId> {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        self.state.update(|s| s.soundboard_mic = enabled).await;
        self.soundboard_mic_links(enabled).await
    }

    /// Re-create the soundboard→mic link if it is enabled
    pub async fn reapply_soundboard_mic(&self) -> Option<ModuleId> {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        if !self.state.snapshot().await.soundboard_mic {
            return None;
        }
        self.soundboard_mic_links(true).await
    }

    async fn soundboard_mic_links(&self, enabled: bool) -> Option<ModuleId> {
        let source = Channel::Soundboard.monitor_source();
        if !enabled {
            self.remove_links(|l| l.source == source && l.sink == names::MIC_SINK)
                .await;
            self.state
                .update(|s| s.aux_links.soundboard_mic = None)
                .await;
            return None;
        }

        if !self.ensure_mic_sink().await {
            return None;
        }
        self.ensure_mic_source().await;
        let input = self.resolve_mic_source().await;
        self.mic_loopback(input).await;

        let handle = self
            .ensure_link(
                &source,
                names::MIC_SINK,
                self.policy.mic_latency_msec,
                LinkPurpose::SoundboardMic,
            )
            .await;
        self.control.set_sink_mute(names::MIC_SINK, false).await;
        self.control.set_sink_volume(names::MIC_SINK, 100).await;
        if let Some(id) = handle {
            let streams = self.inspector.raw_client_streams().await;
            for stream in streams.iter().filter(|s| s.owner_module == Some(id)) {
                self.control.set_client_stream_volume(stream.id, 100).await;
            }
        }

        self.state
            .update(|s| s.aux_links.soundboard_mic = handle)
            .await;
        handle
    }

    /// Toggle the chat→mic link. It reads from the chat FX output while chat
    /// effects are on.
    pub async fn apply_chat_mic(&self, enabled: bool) -> Option<ModuleId> {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        self.state.update(|s| s.chat_mic = enabled).await;
        self.chat_mic_links(enabled).await
    }

    async fn chat_mic_links(&self, enabled: bool) -> Option<ModuleId> {
        let fx_active = self
            .state
            .snapshot()
            .await
            .chat_filter
            .map(|c| c.is_active())
            .unwrap_or(false);
        let dry = Channel::Chat.monitor_source();
        let source = if fx_active {
            names::CHAT_FX_OUTPUT.to_string()
        } else {
            dry.clone()
        };

        self.remove_links(|l| {
            l.sink == names::MIC_SINK
                && (l.source == dry || l.source == names::CHAT_FX_OUTPUT)
                && !(enabled && l.source == source)
        })
        .await;

        let handle = if enabled && self.ensure_mic_sink().await {
            self.ensure_link(
                &source,
                names::MIC_SINK,
                self.policy.mic_latency_msec,
                LinkPurpose::ChatMic,
            )
            .await
        } else {
            None
        };
        self.state.update(|s| s.aux_links.chat_mic = handle).await;
        handle
    }

    /// Re-create every persisted link into the virtual mic
    pub async fn reapply_mic_links(&self) {
        let _serial = self.serializer.lock(MIC_LINKS).await;
        let state = self.state.snapshot().await;
        if state.soundboard_mic {
            self.soundboard_mic_links(true).await;
        } else if state.aux_links.mic_loopback_source.is_some() {
            let input = self.resolve_mic_source().await;
            self.mic_loopback(input).await;
        }
        if state.chat_mic {
            self.chat_mic_links(true).await;
        }
    }

    /// Select the mic FX source as the default input while mic effects are
    /// on, remembering the previous default; restore it once they are off
    pub async fn select_mic_default_source(&self, fx_active: bool) {
        let current = self.control.default_source().await.filter(|s| !s.is_empty());
        if fx_active {
            if let Some(previous) = current.filter(|s| s != names::MIC_FX_SOURCE) {
                self.state
                    .update(|s| s.cached_default_source = Some(previous))
                    .await;
            }
            if !self.control.set_default_source(names::MIC_FX_SOURCE).await {
                warn!("Failed to select mic FX source as default input");
            }
            return;
        }

        let fx_selected = current.as_deref().map_or(true, |s| s == names::MIC_FX_SOURCE);
        let cached = self.state.snapshot().await.cached_default_source;
        if let Some(cached) = cached.filter(|s| !s.is_empty() && fx_selected) {
            debug!(source = %cached, "Restoring default input");
            self.control.set_default_source(&cached).await;
        }
    }
}
