//! Rig service: the single long-lived owner of every component
//!
//! Front ends (the CLI, a future HTTP layer) hold one `Arc<RigService>` and
//! call its operations; background loops are spawned from it and stopped by
//! [`RigService::shutdown`].

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::audio::{AudioControl, GatewayStatus, RestartOutcome, StreamId};
use crate::domain::config::{ConfigStore, DaemonConfig, RigState, StateStore, StateWatcher};
use crate::domain::filter_chain::{
    render_chat_chain, render_mic_chain, ChatFilterSettings, DescriptorStore, MicFilterSettings,
};
use crate::domain::inspector::{ClientStreamGroup, DeviceView, GraphInspector, ListMode};
use crate::domain::monitor::{
    resolve_capture_targets, CaptureSpawner, LevelFeed, LevelMonitor, LevelSnapshot, MonitorStatus,
};
use crate::domain::overrides::{OverrideEnforcer, RoutingOverrides};
use crate::domain::reconciler::{ApplyOptions, LinkPlan, ReconcileReport, Reconciler};
use crate::domain::registry::ResourceRegistry;
use crate::domain::scheduler::{ObserverGate, ObserverGuard, Scheduler};
use crate::domain::soundboard::SoundboardQueue;

const MAX_VOLUME_PERCENT: f64 = 150.0;

fn clamp_percent(percent: f64) -> u32 {
    if percent.is_nan() {
        return 0;
    }
    percent.round().clamp(0.0, MAX_VOLUME_PERCENT) as u32
}

/// Four-digit access PIN, 1000..=9999
fn generate_pin() -> u16 {
    1000 + (Uuid::new_v4().as_u128() % 9000) as u16
}

/// Snapshot for observers
#[derive(Debug, Clone, Serialize)]
pub struct RigStatus {
    pub gateway: GatewayStatus,
    pub monitors: Vec<MonitorStatus>,
    pub links: LinkPlan,
    pub system_output_sink: Option<String>,
    pub stream_output_sink: Option<String>,
    pub soundboard_mic: bool,
    pub chat_mic: bool,
    pub lan_enabled: bool,
    pub overrides: usize,
}

pub struct RigService {
    config: DaemonConfig,
    control: Arc<dyn AudioControl>,
    inspector: Arc<GraphInspector>,
    state: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    enforcer: Arc<OverrideEnforcer>,
    monitor: LevelMonitor,
    feed: Arc<LevelFeed>,
    soundboard: SoundboardQueue,
    scheduler: Scheduler,
    observers: ObserverGate,
}

impl RigService {
    /// Wire every component around the given adapters. Loads the persisted
    /// rig state; nothing touches the audio graph yet.
    pub async fn new(
        config: DaemonConfig,
        control: Arc<dyn AudioControl>,
        spawner: Arc<dyn CaptureSpawner>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let registry = Arc::new(ResourceRegistry::with_rig_devices());
        let inspector = Arc::new(GraphInspector::new(
            control.clone(),
            registry.clone(),
            config.identity.clone(),
        ));
        let state = Arc::new(StateStore::open(store).await);
        let descriptors = DescriptorStore::new(
            config.paths.engine_conf_dir.clone(),
            config.paths.pulse_conf_dir.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            control.clone(),
            inspector.clone(),
            registry,
            state.clone(),
            descriptors,
            config.reconcile.clone(),
        ));
        let enforcer = Arc::new(OverrideEnforcer::new(
            control.clone(),
            inspector.clone(),
            RoutingOverrides::new(state.clone()),
            config.reconcile.override_debounce,
        ));
        let monitor = LevelMonitor::new(spawner, config.monitor.clone());
        let feed = Arc::new(LevelFeed::new(config.monitor.subscriber_buffer));

        Self {
            config,
            control,
            inspector,
            state,
            reconciler,
            enforcer,
            monitor,
            feed,
            soundboard: SoundboardQueue::default(),
            scheduler: Scheduler::new(),
            observers: ObserverGate::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn inspector(&self) -> &GraphInspector {
        &self.inspector
    }

    pub fn monitor(&self) -> &LevelMonitor {
        &self.monitor
    }

    pub fn soundboard(&self) -> &SoundboardQueue {
        &self.soundboard
    }

    pub async fn state(&self) -> RigState {
        self.state.snapshot().await
    }

    /// Register an observer; gated polling runs while any guard is alive
    pub fn observe(&self) -> ObserverGuard {
        self.observers.observe()
    }

    pub async fn status(&self) -> RigStatus {
        let state = self.state.snapshot().await;
        RigStatus {
            gateway: self.control.status(),
            monitors: self.monitor.status(),
            links: state.loopbacks,
            system_output_sink: state.system_output_sink,
            stream_output_sink: state.stream_output_sink,
            soundboard_mic: state.soundboard_mic,
            chat_mic: state.chat_mic,
            lan_enabled: state.lan_enabled,
            overrides: state.overrides.len(),
        }
    }

    // Listings

    pub async fn sinks(&self, mode: ListMode) -> Vec<DeviceView> {
        self.inspector.list_sinks(mode).await
    }

    pub async fn route_sinks(&self) -> Vec<DeviceView> {
        self.inspector.list_route_sinks().await
    }

    pub async fn sources(&self, mode: ListMode) -> Vec<DeviceView> {
        self.inspector.list_sources(mode).await
    }

    pub async fn client_streams(&self) -> Vec<ClientStreamGroup> {
        self.inspector.list_client_streams().await
    }

    // Routing

    pub async fn set_link(&self, source: &str, sink: &str) -> ReconcileReport {
        self.reconciler.set_link(source, sink).await
    }

    pub async fn set_default_sink(&self, sink: &str) -> crate::domain::audio::Result<Option<ReconcileReport>> {
        self.reconciler.set_default_sink(sink).await
    }

    pub async fn set_all_channel_links(&self, sink: &str) -> ReconcileReport {
        self.reconciler.set_all_channel_links(sink).await
    }

    pub async fn set_default_source(&self, source: &str) -> bool {
        if !self.control.set_default_source(source).await {
            return false;
        }
        self.state
            .update(|s| s.system_input_source = Some(source.to_string()))
            .await;
        self.reconciler.reapply_mic_links().await;
        true
    }

    /// Unplug the physical input from the virtual mic
    pub async fn disconnect_mic_input(&self) {
        self.reconciler.clear_mic_loopback().await;
    }

    pub async fn set_override(&self, key: &str, sink: &str) -> bool {
        self.enforcer.apply_override(key, sink).await
    }

    pub async fn clear_override(&self, key: &str) -> bool {
        self.enforcer.clear_override(key).await
    }

    /// One override enforcement pass, outside the periodic loop
    pub async fn enforce_overrides(&self) -> Vec<String> {
        self.enforcer.enforce_pass().await
    }

    pub async fn move_streams(&self, ids: &[StreamId], sink: &str) -> bool {
        let mut all_moved = true;
        for id in ids {
            all_moved &= self.control.move_client_stream(*id, sink).await;
        }
        all_moved
    }

    // Volume

    pub async fn set_sink_volume(&self, sink: &str, percent: f64) -> bool {
        self.control.set_sink_volume(sink, clamp_percent(percent)).await
    }

    pub async fn set_source_volume(&self, source: &str, percent: f64) -> bool {
        self.control
            .set_source_volume(source, clamp_percent(percent))
            .await
    }

    pub async fn set_sink_mute(&self, sink: &str, muted: bool) -> bool {
        self.control.set_sink_mute(sink, muted).await
    }

    pub async fn set_chat_mix(&self, mix: f64) -> bool {
        self.reconciler.set_chat_mix(mix).await
    }

    // Filters

    /// Commit both filter chains and, unless deferred, restart the engine so
    /// they take effect, then bring every dependent link back
    #[instrument(skip(self, mic, chat))]
    pub async fn apply_filter_settings(
        &self,
        mic: MicFilterSettings,
        chat: ChatFilterSettings,
        defer: bool,
    ) -> Option<RestartOutcome> {
        {
            let (mic, chat) = (mic.clone(), chat.clone());
            self.state
                .update(|s| {
                    s.mic_filter = Some(mic);
                    s.chat_filter = Some(chat);
                })
                .await;
        }

        let descriptors = self.reconciler.descriptors();
        for descriptor in [render_mic_chain(&mic), render_chat_chain(&chat)] {
            if let Err(e) = descriptors.commit(&descriptor).await {
                warn!(error = %e, "Failed to commit filter chain");
            }
        }
        if defer {
            debug!("Filter restart deferred");
            return None;
        }

        let previous_sink = self.control.default_sink().await;
        let policy = self.reconciler.policy();
        let outcome = self
            .reconciler
            .restart_backend(&policy.filter_units, policy.filter_settle)
            .await;
        if let Some(sink) = previous_sink.filter(|s| !s.is_empty()) {
            self.control.set_default_sink(&sink).await;
        }
        self.reconciler.select_mic_default_source(mic.is_active()).await;
        self.reconciler.ensure_virtual_mic().await;
        self.reconciler.reapply_mic_links().await;
        self.reconciler.update_chat_links(&chat).await;
        info!(restarted = outcome.restarted(), "Filter settings applied");
        Some(outcome)
    }

    /// Audition the chat gate without persisting its flag
    pub async fn audition_chat_gate(&self, enabled: bool) -> Option<RestartOutcome> {
        let mut chat = self.state.snapshot().await.chat_filter.unwrap_or_default();
        chat.gate_test = enabled;
        if let Err(e) = self
            .reconciler
            .descriptors()
            .commit(&render_chat_chain(&chat))
            .await
        {
            warn!(error = %e, "Failed to commit chat filter chain");
            return None;
        }
        let policy = self.reconciler.policy();
        Some(
            self.reconciler
                .restart_backend(&policy.filter_units, policy.filter_settle)
                .await,
        )
    }

    // Virtual mic and stream mode

    pub async fn set_soundboard_mic(&self, enabled: bool) -> bool {
        let handle = self.reconciler.apply_soundboard_mic(enabled).await;
        !enabled || handle.is_some()
    }

    pub async fn set_chat_mic(&self, enabled: bool) -> bool {
        let handle = self.reconciler.apply_chat_mic(enabled).await;
        !enabled || handle.is_some()
    }

    pub async fn set_stream_link(&self, sink: &str, enabled: bool) -> bool {
        let links = self.reconciler.set_stream_link(sink, enabled).await;
        links
            .get(sink)
            .map(|l| !enabled || l.handle.is_some())
            .unwrap_or(false)
    }

    pub async fn set_stream_output(&self, sink: Option<String>) -> RestartOutcome {
        self.reconciler.set_stream_output(sink).await
    }

    pub async fn clear_stream_output(&self) -> usize {
        self.reconciler.clear_stream_output().await.len()
    }

    /// Explicit backend restart, followed by re-creating every link
    pub async fn restart_audio(&self) -> RestartOutcome {
        let policy = self.reconciler.policy();
        let outcome = self
            .reconciler
            .restart_backend(&policy.filter_units, policy.filter_settle)
            .await;
        if outcome.restarted() {
            self.recover_links().await;
        }
        outcome
    }

    async fn recover_links(&self) {
        self.reconciler.ensure_virtual_mic().await;
        self.reconciler
            .apply_persisted_links(ApplyOptions::immediate())
            .await;
        self.reconciler.apply_stream_links().await;
        self.reconciler.apply_stream_output().await;
        self.reconciler.reapply_mic_links().await;
    }

    // Access

    /// New PIN, persisted
    pub async fn rotate_pin(&self) -> u16 {
        let pin = generate_pin();
        self.state.update(|s| s.pin = Some(pin)).await;
        info!("Access PIN rotated");
        pin
    }

    pub async fn pin(&self) -> Option<u16> {
        self.state.snapshot().await.pin
    }

    pub async fn verify_pin(&self, candidate: &str) -> bool {
        let current = self.pin().await;
        current.is_some() && candidate.trim().parse::<u16>().ok() == current
    }

    pub async fn set_lan_enabled(&self, enabled: bool) {
        self.state.update(|s| s.lan_enabled = enabled).await;
    }

    pub async fn lan_enabled(&self) -> bool {
        self.state.snapshot().await.lan_enabled
    }

    // Levels

    pub fn subscribe_levels(&self) -> mpsc::Receiver<LevelSnapshot> {
        self.feed.subscribe()
    }

    pub fn levels(&self) -> LevelSnapshot {
        self.monitor.snapshot()
    }

    // Lifecycle

    /// Bring the live graph in line with the persisted state
    #[instrument(skip(self))]
    pub async fn startup(&self) {
        self.rotate_pin().await;
        let state = self.state.snapshot().await;

        if state.loopbacks.is_empty() {
            self.reconciler.ensure_default_links().await;
        } else {
            self.reconciler
                .apply_persisted_links(ApplyOptions::default())
                .await;
        }

        if !state.stream_links.is_empty() {
            self.reconciler.apply_stream_links().await;
        }
        if state.stream_output_sink.is_some() {
            self.reconciler.apply_stream_output().await;
        }

        if state.mic_filter.is_some() || state.chat_filter.is_some() {
            let mic = state.mic_filter.clone().unwrap_or_default();
            let chat = state.chat_filter.clone().unwrap_or_default();
            self.apply_filter_settings(mic, chat, false).await;
            self.reconciler.ensure_default_links().await;
        }

        self.reconciler.reapply_mic_links().await;
        info!("Startup reconciliation done");
    }

    /// Second pass after the engine has had time to settle
    async fn startup_recheck(&self) {
        debug!("Startup recheck");
        self.reconciler.ensure_default_links().await;
        self.reconciler.ensure_virtual_mic().await;
        if let Some(chat) = self.state.snapshot().await.chat_filter {
            self.reconciler.update_chat_links(&chat).await;
        }
        let source = self.reconciler.resolve_mic_source().await;
        if source.is_some() {
            self.reconciler.apply_mic_loopback(source).await;
        }
    }

    /// Reload state edited outside the daemon and converge on it
    pub async fn on_state_file_changed(&self) -> bool {
        if !self.state.reload().await {
            return false;
        }
        self.reconciler
            .apply_persisted_links(ApplyOptions::immediate())
            .await;
        self.reconciler.apply_stream_links().await;
        self.reconciler.reapply_mic_links().await;
        true
    }

    /// Spawn the level monitor, the feed, override enforcement and, given
    /// a state file, the state watcher
    pub async fn start_background(self: &Arc<Self>, watch_state: Option<PathBuf>) {
        let streams = self.inspector.raw_client_streams().await;
        self.monitor.start_all(resolve_capture_targets(
            &self.monitor.policy().channels,
            &streams,
        ));

        let monitor_policy = self.monitor.policy().clone();
        let rig = self.clone();
        self.scheduler.spawn_periodic(
            "monitor-targets",
            monitor_policy.retarget_interval,
            None,
            move || {
                let rig = rig.clone();
                async move { rig.monitor.refresh_targets(&rig.inspector).await }
            },
        );

        let (feed, monitor) = (self.feed.clone(), self.monitor.clone());
        self.scheduler.spawn_periodic(
            "level-feed",
            monitor_policy.feed_interval,
            None,
            move || {
                feed.publish(&monitor);
                std::future::ready(())
            },
        );

        let enforcer = self.enforcer.clone();
        self.scheduler.spawn_periodic(
            "override-enforcement",
            self.config.reconcile.poll_interval,
            Some(self.observers.clone()),
            move || {
                let enforcer = enforcer.clone();
                async move {
                    enforcer.enforce_pass().await;
                }
            },
        );

        let rig = self.clone();
        self.scheduler.spawn_after(
            "startup-recheck",
            self.config.reconcile.startup_recheck,
            async move { rig.startup_recheck().await },
        );

        if let Some(path) = watch_state {
            self.watch_state_file(path).await;
        }
        info!("Background tasks started");
    }

    async fn watch_state_file(self: &Arc<Self>, path: PathBuf) {
        let watcher = match StateWatcher::new(path).await {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "State watcher unavailable");
                return;
            }
        };
        let mut changes = watcher.subscribe();
        let rig = self.clone();
        self.scheduler.spawn("state-watcher", async move {
            let _watcher = watcher;
            loop {
                match changes.recv().await {
                    Ok(_) => {
                        rig.on_state_file_changed().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "State watcher lagged");
                        rig.on_state_file_changed().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Stop every background task and capture process
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.monitor.shutdown();
        info!("Rig service stopped");
    }
}
