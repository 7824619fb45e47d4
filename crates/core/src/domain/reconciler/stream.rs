//! Stream mode: channel monitors mixed into the `stream` sink, and the stream
//! monitor played back on an output of choice

use std::collections::{BTreeMap, HashSet};
use tracing::{info, instrument, warn};

use super::{Reconciler, STREAM_LINKS};
use crate::domain::audio::{names, LinkRecord, ModuleId, RestartOutcome};
use crate::domain::config::StreamLinkState;
use crate::domain::filter_chain::{render_stream_output, DescriptorKind};
use crate::domain::registry::LinkPurpose;

fn stream_monitor() -> String {
    format!("{}{}", names::STREAM_SINK, names::MONITOR_SUFFIX)
}

impl Reconciler {
    /// Flip one stream-mode flag and converge the `→stream` links
    pub async fn set_stream_link(&self, sink: &str, enabled: bool) -> BTreeMap<String, StreamLinkState> {
        let _serial = self.serializer.lock(STREAM_LINKS).await;
        self.state
            .update(|s| s.stream_links.entry(sink.to_string()).or_default().enabled = enabled)
            .await;
        self.stream_links().await
    }

    pub async fn apply_stream_links(&self) -> BTreeMap<String, StreamLinkState> {
        let _serial = self.serializer.lock(STREAM_LINKS).await;
        self.stream_links().await
    }

    async fn stream_links(&self) -> BTreeMap<String, StreamLinkState> {
        let flags = self.state.snapshot().await.stream_links;
        let wanted: HashSet<String> = flags
            .iter()
            .filter(|(_, link)| link.enabled)
            .map(|(sink, _)| format!("{}{}", sink, names::MONITOR_SUFFIX))
            .collect();

        let live = self
            .inspector
            .list_loaded_links(|l| l.sink == names::STREAM_SINK)
            .await;
        let mut kept: BTreeMap<String, ModuleId> = BTreeMap::new();
        for link in live {
            if wanted.contains(&link.source) && !kept.contains_key(&link.source) {
                self.registry.register_module(link.handle, LinkPurpose::StreamMode);
                kept.insert(link.source, link.handle);
            } else {
                self.destroy_link(link.handle).await;
            }
        }

        let mut updated = flags;
        for (sink, link) in updated.iter_mut() {
            let source = format!("{}{}", sink, names::MONITOR_SUFFIX);
            link.handle = if !link.enabled {
                None
            } else if let Some(handle) = kept.get(&source) {
                Some(*handle)
            } else {
                self.create_link(
                    &source,
                    names::STREAM_SINK,
                    self.policy.stream_latency_msec,
                    LinkPurpose::StreamMode,
                )
                .await
            };
        }

        let persisted = updated.clone();
        self.state.update(|s| s.stream_links = persisted).await;
        updated
    }

    /// Play the stream mix on `sink`, or nowhere. The choice is written to the
    /// bootstrap descriptor and takes effect through a backend restart.
    #[instrument(skip(self))]
    pub async fn set_stream_output(&self, sink: Option<String>) -> RestartOutcome {
        let _serial = self.serializer.lock(STREAM_LINKS).await;
        let sink = sink.filter(|s| !s.is_empty());
        let descriptor = render_stream_output(sink.as_deref(), self.policy.stream_latency_msec);
        if let Err(e) = self.descriptors.commit(&descriptor).await {
            warn!(error = %e, "Failed to write stream output descriptor");
        }
        self.state
            .update(|s| s.stream_output_sink = sink.clone())
            .await;

        let units = self.policy.link_units.clone();
        let outcome = self.restart_backend(&units, self.policy.restart_settle).await;
        self.stream_output_link(sink.as_deref()).await;

        self.ensure_virtual_mic().await;
        self.reapply_soundboard_mic().await;
        self.stream_links().await;
        info!(sink = ?sink, restarted = outcome.restarted(), "Stream output applied");
        outcome
    }

    /// Converge `stream.monitor` links onto the chosen output
    async fn stream_output_link(&self, sink: Option<&str>) -> Option<ModuleId> {
        let monitor = stream_monitor();
        self.remove_links(|l| l.source == monitor && Some(l.sink.as_str()) != sink)
            .await;
        let sink = sink?;
        self.ensure_link(
            &monitor,
            sink,
            self.policy.stream_latency_msec,
            LinkPurpose::StreamOutput,
        )
        .await
    }

    /// Stop playing the stream mix anywhere
    pub async fn clear_stream_output(&self) -> Vec<LinkRecord> {
        let _serial = self.serializer.lock(STREAM_LINKS).await;
        if let Err(e) = self.descriptors.remove(DescriptorKind::StreamOutput).await {
            warn!(error = %e, "Failed to remove stream output descriptor");
        }
        self.state.update(|s| s.stream_output_sink = None).await;
        let monitor = stream_monitor();
        self.remove_links(|l| l.source == monitor).await
    }

    /// Re-create the stream output link from persisted state
    pub async fn apply_stream_output(&self) -> Option<ModuleId> {
        let _serial = self.serializer.lock(STREAM_LINKS).await;
        let sink = self.state.snapshot().await.stream_output_sink;
        self.stream_output_link(sink.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{MemoryStore, RigState, StateStore};
    use crate::domain::filter_chain::DescriptorStore;
    use crate::domain::inspector::{GraphInspector, SelfIdentity};
    use crate::domain::reconciler::ReconcilePolicy;
    use crate::domain::registry::ResourceRegistry;
    use crate::testing::FakeAudioControl;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn fixture() -> (Arc<FakeAudioControl>, Arc<StateStore>, Reconciler, TempDir) {
        let control = Arc::new(FakeAudioControl::with_rig());
        let registry = Arc::new(ResourceRegistry::with_rig_devices());
        let inspector = Arc::new(GraphInspector::new(
            control.clone(),
            registry.clone(),
            SelfIdentity::default(),
        ));
        let store = Arc::new(StateStore::open(Arc::new(MemoryStore::with_state(RigState::default()))).await);
        let dir = TempDir::new().unwrap();
        let reconciler = Reconciler::new(
            control.clone(),
            inspector,
            registry,
            store.clone(),
            DescriptorStore::new(dir.path().join("engine"), dir.path().join("pulse")),
            ReconcilePolicy::default(),
        );
        (control, store, reconciler, dir)
    }

    #[tokio::test]
    async fn test_stream_links_follow_flags() {
        let (control, store, reconciler, _dir) = fixture().await;
        control.load_link("chat.monitor", "stream");

        let links = reconciler.set_stream_link("game", true).await;
        assert!(control.has_link("game.monitor", "stream"));
        assert!(!control.has_link("chat.monitor", "stream"));
        assert!(links["game"].handle.is_some());
        assert_eq!(store.snapshot().await.stream_links["game"].handle, links["game"].handle);

        control.reset_calls();
        reconciler.apply_stream_links().await;
        assert_eq!(control.load_count(), 0);
        assert_eq!(control.unload_count(), 0);

        let links = reconciler.set_stream_link("game", false).await;
        assert!(!control.has_link("game.monitor", "stream"));
        assert_eq!(links["game"].handle, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_output_set_and_clear() {
        let (control, store, reconciler, _dir) = fixture().await;
        control.load_link("stream.monitor", "hw0");

        let outcome = reconciler.set_stream_output(Some("hw1".to_string())).await;
        assert!(outcome.restarted());
        assert!(control.has_link("stream.monitor", "hw1"));
        assert!(!control.has_link("stream.monitor", "hw0"));
        assert!(control.has_sink("mic"));
        assert_eq!(store.snapshot().await.stream_output_sink.as_deref(), Some("hw1"));
        assert!(reconciler.descriptors().exists(DescriptorKind::StreamOutput));

        let removed = reconciler.clear_stream_output().await;
        assert_eq!(removed.len(), 1);
        assert!(control.links_from("stream.monitor").is_empty());
        assert_eq!(store.snapshot().await.stream_output_sink, None);
        assert!(!reconciler.descriptors().exists(DescriptorKind::StreamOutput));
    }
}
