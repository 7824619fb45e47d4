//! Reconciler: converges the live link graph onto the desired routing state
//!
//! All create/destroy decisions for loopback links are made here. Passes that
//! touch the same group of links are serialized by key; unrelated groups may
//! run concurrently.

mod mic;
mod stream;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::audio::{
    names, AudioControl, AudioError, Channel, LinkRecord, ModuleId, RestartOutcome, Result,
};
use crate::domain::config::StateStore;
use crate::domain::filter_chain::{render_link_bootstrap, ChatFilterSettings, DescriptorStore};
use crate::domain::inspector::GraphInspector;
use crate::domain::registry::{LinkPurpose, ResourceRegistry};
use crate::domain::scheduler::KeyedSerializer;

pub use mic::MIC_AUX_SOURCES;

/// Desired routing: source → sink. An empty sink means "no link".
pub type LinkPlan = BTreeMap<String, String>;

const CHANNEL_LINKS: &str = "channel-links";
const STREAM_LINKS: &str = "stream-links";
const MIC_LINKS: &str = "mic";

/// Timing and shape of reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilePolicy {
    pub channel_latency_msec: u32,
    pub mic_latency_msec: u32,
    pub stream_latency_msec: u32,
    /// Wait after a link-level backend restart
    #[serde(with = "crate::domain::config::millis")]
    pub restart_settle: Duration,
    /// Wait after a filter-level backend restart
    #[serde(with = "crate::domain::config::millis")]
    pub filter_settle: Duration,
    /// Retries after the first failed mic loopback load
    pub mic_link_retries: u32,
    #[serde(with = "crate::domain::config::millis")]
    pub mic_link_retry_delay: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub override_debounce: Duration,
    /// Cadence of the override enforcement loop
    #[serde(with = "crate::domain::config::millis")]
    pub poll_interval: Duration,
    /// Delay of the second default-link check after startup
    #[serde(with = "crate::domain::config::millis")]
    pub startup_recheck: Duration,
    /// Units restarted for link changes
    pub link_units: Vec<String>,
    /// Units restarted for filter chain changes
    pub filter_units: Vec<String>,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            channel_latency_msec: 20,
            mic_latency_msec: 10,
            stream_latency_msec: 10,
            restart_settle: Duration::from_millis(700),
            filter_settle: Duration::from_millis(800),
            mic_link_retries: 4,
            mic_link_retry_delay: Duration::from_millis(800),
            override_debounce: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(1),
            startup_recheck: Duration::from_millis(1500),
            link_units: vec!["pipewire-pulse".to_string()],
            filter_units: vec!["pipewire".to_string(), "pipewire-pulse".to_string()],
        }
    }
}

/// How a plan is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Restart the backend so links are loaded from the bootstrap descriptor
    pub restart_backend: bool,
    /// Create missing links directly
    pub load_immediately: bool,
    /// Rewrite the bootstrap descriptor
    pub write_descriptor: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            restart_backend: true,
            load_immediately: true,
            write_descriptor: true,
        }
    }
}

impl ApplyOptions {
    /// Load directly, no restart
    pub fn immediate() -> Self {
        Self {
            restart_backend: false,
            load_immediately: true,
            write_descriptor: true,
        }
    }

    /// Restart only, nothing loaded directly
    pub fn via_restart() -> Self {
        Self {
            restart_backend: true,
            load_immediately: false,
            write_descriptor: true,
        }
    }
}

/// What a pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub destroyed: Vec<LinkRecord>,
    pub created: Vec<LinkRecord>,
    pub restart: Option<RestartOutcome>,
    pub persisted: LinkPlan,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.destroyed.is_empty() && self.created.is_empty() && self.restart.is_none()
    }
}

/// Sources that are never treated as stale: sink monitors and the chat FX
/// output are recognised by name, not by presence in a listing
pub fn is_always_valid_source(source: &str) -> bool {
    source.ends_with(names::MONITOR_SUFFIX) || source == names::CHAT_FX_OUTPUT
}

/// Sinks whose incoming links belong to other link groups
fn is_channel_link_sink(sink: &str) -> bool {
    sink != names::MIC_SINK && sink != names::STREAM_SINK && sink != names::CHAT_FX_INPUT
}

fn managed_sources(desired: &LinkPlan) -> HashSet<String> {
    let mut sources: HashSet<String> = desired.keys().cloned().collect();
    for channel in [Channel::Browser, Channel::Game, Channel::Chat, Channel::Soundboard] {
        sources.insert(channel.monitor_source());
    }
    sources.insert(names::CHAT_FX_OUTPUT.to_string());
    sources
}

/// Applies desired routing to the live graph
pub struct Reconciler {
    control: Arc<dyn AudioControl>,
    inspector: Arc<GraphInspector>,
    registry: Arc<ResourceRegistry>,
    state: Arc<StateStore>,
    descriptors: DescriptorStore,
    policy: ReconcilePolicy,
    serializer: KeyedSerializer,
}

impl Reconciler {
    pub fn new(
        control: Arc<dyn AudioControl>,
        inspector: Arc<GraphInspector>,
        registry: Arc<ResourceRegistry>,
        state: Arc<StateStore>,
        descriptors: DescriptorStore,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            control,
            inspector,
            registry,
            state,
            descriptors,
            policy,
            serializer: KeyedSerializer::new(),
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    pub fn descriptors(&self) -> &DescriptorStore {
        &self.descriptors
    }

    /// Converge the channel links onto `desired`.
    ///
    /// Links for a managed source whose sink differs, whose source is gone,
    /// or which duplicate another link are destroyed first. The plan is
    /// filtered to live (or always-valid) sources and persisted. Missing links
    /// then come from a backend restart or are created directly, per `opts`.
    /// The soundboard→mic link is re-applied last.
    #[instrument(skip(self, desired), fields(links = desired.len()))]
    pub async fn apply_desired_links(&self, desired: LinkPlan, opts: ApplyOptions) -> ReconcileReport {
        let _serial = self.serializer.lock(CHANNEL_LINKS).await;
        self.apply_plan(desired, opts).await
    }

    /// Re-apply the persisted plan
    pub async fn apply_persisted_links(&self, opts: ApplyOptions) -> ReconcileReport {
        let _serial = self.serializer.lock(CHANNEL_LINKS).await;
        let desired = self.state.snapshot().await.loopbacks;
        self.apply_plan(desired, opts).await
    }

    fn is_channel_output(&self, handle: ModuleId) -> bool {
        matches!(
            self.registry.module_purpose(handle),
            None | Some(LinkPurpose::ChannelOutput)
        )
    }

    async fn live_channel_links(&self, managed: &HashSet<String>) -> Vec<LinkRecord> {
        self.inspector
            .list_loaded_links(|l| {
                managed.contains(&l.source)
                    && is_channel_link_sink(&l.sink)
                    && self.is_channel_output(l.handle)
            })
            .await
    }

    async fn apply_plan(&self, mut desired: LinkPlan, opts: ApplyOptions) -> ReconcileReport {
        // The virtual mic is never played back
        desired.remove(&Channel::Mic.monitor_source());

        let managed = managed_sources(&desired);
        let live_sources = self.inspector.live_source_names().await;
        let is_valid = |source: &str| live_sources.contains(source) || is_always_valid_source(source);

        let mut kept: HashSet<(String, String)> = HashSet::new();
        let mut doomed = Vec::new();
        for link in self.live_channel_links(&managed).await {
            let wanted = desired.get(&link.source) == Some(&link.sink);
            if wanted
                && is_valid(link.source.as_str())
                && kept.insert((link.source.clone(), link.sink.clone()))
            {
                self.registry.register_module(link.handle, LinkPurpose::ChannelOutput);
            } else {
                doomed.push(link);
            }
        }

        for link in &doomed {
            debug!(source = %link.source, sink = %link.sink, handle = %link.handle, "Destroying link");
            self.destroy_link(link.handle).await;
        }

        let filtered: LinkPlan = desired
            .into_iter()
            .filter(|(source, _)| is_valid(source.as_str()))
            .collect();
        self.state
            .update(|s| s.loopbacks = filtered.clone())
            .await;

        if opts.write_descriptor {
            let descriptor = render_link_bootstrap(&filtered, self.policy.channel_latency_msec);
            if let Err(e) = self.descriptors.commit(&descriptor).await {
                warn!(error = %e, "Failed to write link bootstrap descriptor");
            }
        }

        let missing: Vec<(String, String)> = filtered
            .iter()
            .filter(|(source, sink)| {
                !sink.is_empty() && !kept.contains(&((*source).clone(), (*sink).clone()))
            })
            .map(|(source, sink)| (source.clone(), sink.clone()))
            .collect();

        let mut report = ReconcileReport {
            destroyed: doomed,
            ..Default::default()
        };

        if opts.restart_backend {
            if missing.is_empty() && report.destroyed.is_empty() {
                debug!("No drift, backend restart skipped");
            } else {
                let units = self.policy.link_units.clone();
                let outcome = self.restart_backend(&units, self.policy.restart_settle).await;
                report.restart = Some(outcome);
                report.created = if outcome.restarted() {
                    self.create_missing(&filtered).await
                } else {
                    // Not allowed to restart yet: converge directly
                    self.create_links(&missing).await
                };
            }
        } else if opts.load_immediately {
            report.created = self.create_links(&missing).await;
        }

        self.reapply_soundboard_mic().await;

        info!(
            destroyed = report.destroyed.len(),
            created = report.created.len(),
            restarted = report.restart.map(|r| r.restarted()).unwrap_or(false),
            "Links reconciled"
        );
        report.persisted = filtered;
        report
    }

    /// Re-verify after a restart: create whatever the bootstrap did not bring back
    async fn create_missing(&self, plan: &LinkPlan) -> Vec<LinkRecord> {
        let live: HashSet<(String, String)> = self
            .live_channel_links(&managed_sources(plan))
            .await
            .into_iter()
            .map(|l| {
                self.registry.register_module(l.handle, LinkPurpose::ChannelOutput);
                (l.source, l.sink)
            })
            .collect();
        let missing: Vec<(String, String)> = plan
            .iter()
            .filter(|(source, sink)| {
                !sink.is_empty() && !live.contains(&((*source).clone(), (*sink).clone()))
            })
            .map(|(source, sink)| (source.clone(), sink.clone()))
            .collect();
        self.create_links(&missing).await
    }

    async fn create_links(&self, links: &[(String, String)]) -> Vec<LinkRecord> {
        let mut created = Vec::new();
        for (source, sink) in links {
            let latency = self.policy.channel_latency_msec;
            if let Some(handle) = self
                .create_link(source, sink, latency, LinkPurpose::ChannelOutput)
                .await
            {
                created.push(LinkRecord {
                    source: source.clone(),
                    sink: sink.clone(),
                    handle,
                    latency_msec: Some(latency),
                });
            }
        }
        created
    }

    /// Load one loopback and record it in the registry
    pub(crate) async fn create_link(
        &self,
        source: &str,
        sink: &str,
        latency_msec: u32,
        purpose: LinkPurpose,
    ) -> Option<ModuleId> {
        let args = LinkRecord::module_args(source, sink, latency_msec);
        let handle = self.control.load_module(names::LOOPBACK_MODULE, &args).await;
        match handle {
            Some(id) => {
                debug!(source, sink, handle = %id, ?purpose, "Link created");
                self.registry.register_module(id, purpose);
            }
            None => warn!(source, sink, "Failed to create link"),
        }
        handle
    }

    pub(crate) async fn destroy_link(&self, handle: ModuleId) -> bool {
        self.registry.forget_module(handle);
        self.control.unload_module(handle).await
    }

    /// Keep exactly one live `source → sink` link, creating it when absent
    pub(crate) async fn ensure_link(
        &self,
        source: &str,
        sink: &str,
        latency_msec: u32,
        purpose: LinkPurpose,
    ) -> Option<ModuleId> {
        let live = self
            .inspector
            .list_loaded_links(|l| l.source == source && l.sink == sink)
            .await;
        if let Some((first, extra)) = live.split_first() {
            for duplicate in extra {
                self.destroy_link(duplicate.handle).await;
            }
            self.registry.register_module(first.handle, purpose);
            return Some(first.handle);
        }
        self.create_link(source, sink, latency_msec, purpose).await
    }

    /// Destroy every live link matching `predicate`
    pub(crate) async fn remove_links<P>(&self, predicate: P) -> Vec<LinkRecord>
    where
        P: Fn(&LinkRecord) -> bool,
    {
        let links = self.inspector.list_loaded_links(predicate).await;
        for link in &links {
            self.destroy_link(link.handle).await;
        }
        links
    }

    /// Gated restart followed by the settle delay. All module handles are
    /// forgotten since the backend unloads them.
    pub async fn restart_backend(&self, units: &[String], settle: Duration) -> RestartOutcome {
        let refs: Vec<&str> = units.iter().map(String::as_str).collect();
        let outcome = self.control.restart_backend(&refs).await;
        match outcome {
            RestartOutcome::Restarted => {
                self.registry.forget_all_modules();
                tokio::time::sleep(settle).await;
            }
            RestartOutcome::NotYet { retry_in_secs } => {
                info!(?units, retry_in_secs, "Backend restart deferred by cooldown");
            }
        }
        outcome
    }

    /// Persisted system output, else the engine default
    pub async fn system_sink(&self) -> Option<String> {
        let persisted = self.state.snapshot().await.system_output_sink;
        match persisted.filter(|s| !s.is_empty()) {
            Some(sink) => Some(sink),
            None => self.control.default_sink().await.filter(|s| !s.is_empty()),
        }
    }

    async fn live_default_channel_sources(&self) -> HashSet<String> {
        let managed = managed_sources(&LinkPlan::new());
        self.live_channel_links(&managed)
            .await
            .into_iter()
            .map(|l| l.source)
            .collect()
    }

    /// Make sure browser, game and soundboard play to the system output
    pub async fn ensure_default_links(&self) -> Option<ReconcileReport> {
        let _serial = self.serializer.lock(CHANNEL_LINKS).await;
        let Some(system_sink) = self.system_sink().await else {
            debug!("No system output sink, default links skipped");
            return None;
        };

        let mut plan = self.state.snapshot().await.loopbacks;
        let mut changed = false;
        for channel in Channel::DEFAULT_LINKED {
            let entry = plan.entry(channel.monitor_source()).or_default();
            if entry.is_empty() {
                *entry = system_sink.clone();
                changed = true;
            }
        }

        let live = self.live_default_channel_sources().await;
        let required: Vec<String> = Channel::DEFAULT_LINKED
            .iter()
            .map(|c| c.monitor_source())
            .collect();
        let has_any = required.iter().any(|s| live.contains(s));
        let any_missing = required.iter().any(|s| !live.contains(s));
        if !changed && !any_missing {
            return None;
        }

        let opts = ApplyOptions {
            restart_backend: !has_any || any_missing,
            load_immediately: has_any && !any_missing,
            write_descriptor: true,
        };
        Some(self.apply_plan(plan, opts).await)
    }

    /// Change one channel's target. An empty sink removes the link.
    pub async fn set_link(&self, source: &str, sink: &str) -> ReconcileReport {
        let _serial = self.serializer.lock(CHANNEL_LINKS).await;
        let mut plan = self.state.snapshot().await.loopbacks;
        plan.insert(source.to_string(), sink.to_string());
        self.apply_plan(plan, ApplyOptions::immediate()).await
    }

    /// Select the system output and re-check the default links
    pub async fn set_default_sink(&self, sink: &str) -> Result<Option<ReconcileReport>> {
        if sink == names::MIC_SINK {
            return Err(AudioError::Rejected(
                "the virtual mic cannot be the default output".to_string(),
            ));
        }
        if !self.control.set_default_sink(sink).await {
            return Err(AudioError::DeviceNotFound(sink.to_string()));
        }
        self.state
            .update(|s| s.system_output_sink = Some(sink.to_string()))
            .await;
        Ok(self.ensure_default_links().await)
    }

    /// Point every default channel at `sink`, then refresh chat links
    pub async fn set_all_channel_links(&self, sink: &str) -> ReconcileReport {
        let report = {
            let _serial = self.serializer.lock(CHANNEL_LINKS).await;
            let mut plan = self.state.snapshot().await.loopbacks;
            for channel in Channel::DEFAULT_LINKED {
                plan.insert(channel.monitor_source(), sink.to_string());
            }
            self.apply_plan(plan, ApplyOptions::immediate()).await
        };
        let chat = self.state.snapshot().await.chat_filter.unwrap_or_default();
        self.update_chat_links(&chat).await;
        report
    }

    /// Chat always plays to the system output; the chat FX output does too
    /// while chat effects are on. Then the FX feed follows.
    pub async fn update_chat_links(&self, settings: &ChatFilterSettings) -> Option<ReconcileReport> {
        let report = {
            let _serial = self.serializer.lock(CHANNEL_LINKS).await;
            let Some(system_sink) = self.system_sink().await else {
                debug!("No system output sink, chat links skipped");
                return None;
            };
            let mut plan = self.state.snapshot().await.loopbacks;
            for channel in Channel::DEFAULT_LINKED {
                plan.entry(channel.monitor_source())
                    .or_insert_with(|| system_sink.clone());
            }
            plan.insert(Channel::Chat.monitor_source(), system_sink.clone());
            if settings.is_active() {
                plan.insert(names::CHAT_FX_OUTPUT.to_string(), system_sink);
            } else {
                plan.remove(names::CHAT_FX_OUTPUT);
            }
            self.apply_plan(plan, ApplyOptions::via_restart()).await
        };
        self.apply_chat_fx_feed(settings.is_active()).await;
        Some(report)
    }

    /// Feed the chat monitor into the chat filter chain while effects are on
    pub async fn apply_chat_fx_feed(&self, enable: bool) -> Option<ModuleId> {
        let feed_source = Channel::Chat.monitor_source();
        let handle = if enable {
            self.ensure_link(
                &feed_source,
                names::CHAT_FX_INPUT,
                self.policy.channel_latency_msec,
                LinkPurpose::ChatFxFeed,
            )
            .await
        } else {
            self.remove_links(|l| l.source == feed_source && l.sink == names::CHAT_FX_INPUT)
                .await;
            None
        };

        // Recorded handles are not trusted: indices restart with the backend
        self.state
            .update(|s| s.aux_links.chat_fx_feed = handle)
            .await;
        handle
    }

    /// Dry/wet balance of chat: the dry link at `100 - mix`, the wet link at
    /// `mix` percent
    pub async fn set_chat_mix(&self, mix: f64) -> bool {
        let mix = if mix.is_nan() { 0.0 } else { mix.clamp(0.0, 100.0) };
        let dry = (100.0 - mix).round().clamp(0.0, 150.0) as u32;
        let wet = mix.round().clamp(0.0, 150.0) as u32;

        self.state
            .update(|s| s.chat_filter.get_or_insert_with(Default::default).mix = mix)
            .await;

        let dry_source = Channel::Chat.monitor_source();
        let links = self
            .inspector
            .list_loaded_links(|l| is_channel_link_sink(&l.sink))
            .await;
        let dry_link = links.iter().find(|l| l.source == dry_source);
        let wet_link = links.iter().find(|l| l.source == names::CHAT_FX_OUTPUT);
        let (Some(dry_link), Some(wet_link)) = (dry_link, wet_link) else {
            debug!("Chat dry/wet links not both present, mix not applied");
            return false;
        };

        let streams = self.inspector.raw_client_streams().await;
        let mut applied = false;
        for stream in streams {
            let volume = match stream.owner_module {
                Some(owner) if owner == dry_link.handle => dry,
                Some(owner) if owner == wet_link.handle => wet,
                _ => continue,
            };
            applied |= self.control.set_client_stream_volume(stream.id, volume).await;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::MemoryStore;
    use crate::domain::inspector::SelfIdentity;
    use crate::testing::FakeAudioControl;
    use tempfile::TempDir;

    struct Fixture {
        control: Arc<FakeAudioControl>,
        state: Arc<StateStore>,
        registry: Arc<ResourceRegistry>,
        reconciler: Reconciler,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let control = Arc::new(FakeAudioControl::with_rig());
        let registry = Arc::new(ResourceRegistry::with_rig_devices());
        let inspector = Arc::new(GraphInspector::new(
            control.clone(),
            registry.clone(),
            SelfIdentity::default(),
        ));
        let state = Arc::new(StateStore::open(Arc::new(MemoryStore::new())).await);
        let dir = TempDir::new().unwrap();
        let descriptors = DescriptorStore::new(dir.path().join("engine"), dir.path().join("pulse"));
        let reconciler = Reconciler::new(
            control.clone(),
            inspector,
            registry.clone(),
            state.clone(),
            descriptors,
            ReconcilePolicy::default(),
        );
        Fixture {
            control,
            state,
            registry,
            reconciler,
            _dir: dir,
        }
    }

    fn plan(entries: &[(&str, &str)]) -> LinkPlan {
        entries
            .iter()
            .map(|(s, k)| (s.to_string(), k.to_string()))
            .collect()
    }

    #[test]
    fn test_always_valid_sources() {
        assert!(is_always_valid_source("browser.monitor"));
        assert!(is_always_valid_source("chat_fx_output"));
        assert!(!is_always_valid_source("usb_mic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_missing_links_immediately() {
        let f = fixture().await;
        let report = f
            .reconciler
            .apply_desired_links(
                plan(&[("browser.monitor", "hw0"), ("game.monitor", "hw0"), ("chat.monitor", "hw0")]),
                ApplyOptions::immediate(),
            )
            .await;

        assert_eq!(report.created.len(), 3);
        assert!(report.destroyed.is_empty());
        assert!(f.control.has_link("browser.monitor", "hw0"));
        assert_eq!(f.state.snapshot().await.loopbacks.len(), 3);
        assert!(f
            .reconciler
            .descriptors()
            .exists(crate::domain::filter_chain::DescriptorKind::LinkBootstrap));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_pass_is_noop() {
        let f = fixture().await;
        let desired = plan(&[("browser.monitor", "hw0"), ("game.monitor", "hw1")]);
        f.reconciler
            .apply_desired_links(desired.clone(), ApplyOptions::default())
            .await;
        f.control.reset_calls();

        let report = f
            .reconciler
            .apply_desired_links(desired, ApplyOptions::default())
            .await;
        assert!(report.is_noop());
        assert_eq!(f.control.load_count(), 0);
        assert_eq!(f.control.unload_count(), 0);
        assert!(f.control.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_target_replaces_only_that_link() {
        let f = fixture().await;
        let chat = f.control.load_link("chat.monitor", "hw0");
        let old_browser = f.control.load_link("browser.monitor", "hw1");

        let report = f
            .reconciler
            .apply_desired_links(
                plan(&[("browser.monitor", "hw0"), ("chat.monitor", "hw0")]),
                ApplyOptions::immediate(),
            )
            .await;

        assert_eq!(report.destroyed.len(), 1);
        assert_eq!(report.destroyed[0].handle, old_browser);
        assert_eq!(report.created.len(), 1);
        assert!(f.control.has_module(chat));
        assert!(f.control.has_link("browser.monitor", "hw0"));
        assert!(!f.control.has_link("browser.monitor", "hw1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_source_is_dropped_from_plan() {
        let f = fixture().await;
        f.control.load_link("usb_mic", "hw0");
        f.control.remove_source("usb_mic");

        let report = f
            .reconciler
            .apply_desired_links(
                plan(&[("usb_mic", "hw0"), ("mic.monitor", "hw0"), ("chat_fx_output", "hw0")]),
                ApplyOptions::immediate(),
            )
            .await;

        assert_eq!(report.destroyed.len(), 1);
        // Always-valid source kept even though it is not listed
        assert_eq!(report.persisted, plan(&[("chat_fx_output", "hw0")]));
        assert!(f.control.has_link("chat_fx_output", "hw0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_not_yet_creates_directly() {
        let f = fixture().await;
        f.control
            .set_restart_outcome(RestartOutcome::NotYet { retry_in_secs: 9 });

        let report = f
            .reconciler
            .apply_desired_links(plan(&[("game.monitor", "hw0")]), ApplyOptions::via_restart())
            .await;
        assert_eq!(report.restart, Some(RestartOutcome::NotYet { retry_in_secs: 9 }));
        assert_eq!(report.created.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reverifies_after_settle() {
        let f = fixture().await;
        f.control.load_link("browser.monitor", "hw1");
        f.control.set_restart_drops_modules(true);

        let report = f
            .reconciler
            .apply_desired_links(plan(&[("browser.monitor", "hw0")]), ApplyOptions::via_restart())
            .await;
        assert_eq!(report.restart, Some(RestartOutcome::Restarted));
        assert_eq!(f.control.restarts(), vec![vec!["pipewire-pulse".to_string()]]);
        assert!(f.control.has_link("browser.monitor", "hw0"));
        assert_eq!(f.control.links().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_link_groups_untouched() {
        let f = fixture().await;
        f.control.load_link("soundboard.monitor", "mic");
        f.control.load_link("game.monitor", "stream");
        f.control.load_link("chat.monitor", "chat_fx_input");

        let report = f
            .reconciler
            .apply_desired_links(plan(&[("browser.monitor", "hw0")]), ApplyOptions::immediate())
            .await;
        assert!(report.destroyed.is_empty());
        assert_eq!(f.control.links().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_default_links_fills_missing() {
        let f = fixture().await;
        let report = f.reconciler.ensure_default_links().await.unwrap();
        assert_eq!(report.persisted.len(), 3);
        for source in ["browser.monitor", "game.monitor", "soundboard.monitor"] {
            assert!(f.control.has_link(source, "hw0"), "missing {}", source);
        }

        f.control.reset_calls();
        assert!(f.reconciler.ensure_default_links().await.is_none());
        assert_eq!(f.control.load_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_default_sink_rejects_mic() {
        let f = fixture().await;
        let err = f.reconciler.set_default_sink("mic").await.unwrap_err();
        assert!(matches!(err, AudioError::Rejected(_)));

        f.reconciler.set_default_sink("hw1").await.unwrap();
        assert_eq!(f.control.current_default_sink().as_deref(), Some("hw1"));
        assert_eq!(
            f.state.snapshot().await.system_output_sink.as_deref(),
            Some("hw1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_links_follow_fx_state() {
        let f = fixture().await;
        let on = ChatFilterSettings {
            noise_suppression: true,
            ..Default::default()
        };
        f.reconciler.update_chat_links(&on).await.unwrap();
        assert!(f.control.has_link("chat.monitor", "hw0"));
        assert!(f.control.has_link("chat_fx_output", "hw0"));
        assert!(f.control.has_link("chat.monitor", "chat_fx_input"));
        let feed = f.state.snapshot().await.aux_links.chat_fx_feed.unwrap();
        assert_eq!(f.registry.module_purpose(feed), Some(LinkPurpose::ChatFxFeed));

        f.reconciler
            .update_chat_links(&ChatFilterSettings::default())
            .await
            .unwrap();
        assert!(f.control.has_link("chat.monitor", "hw0"));
        assert!(!f.control.has_link("chat_fx_output", "hw0"));
        assert!(!f.control.has_link("chat.monitor", "chat_fx_input"));
        assert_eq!(f.state.snapshot().await.aux_links.chat_fx_feed, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_mix_sets_dry_and_wet_volumes() {
        let f = fixture().await;
        let dry = f.control.load_link("chat.monitor", "hw0");
        let wet = f.control.load_link("chat_fx_output", "hw0");

        assert!(f.reconciler.set_chat_mix(30.0).await);
        let dry_stream = f.control.stream_of_module(dry).unwrap();
        let wet_stream = f.control.stream_of_module(wet).unwrap();
        assert_eq!(f.control.stream_volume(dry_stream), Some(70));
        assert_eq!(f.control.stream_volume(wet_stream), Some(30));

        assert!(f.reconciler.set_chat_mix(400.0).await);
        assert_eq!(f.control.stream_volume(dry_stream), Some(0));
        assert_eq!(f.control.stream_volume(wet_stream), Some(100));
    }
}
