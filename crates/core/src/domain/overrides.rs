//! Per-application sink overrides and their enforcement against drift

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::audio::{AudioControl, StreamId};
use crate::domain::config::StateStore;
use crate::domain::inspector::GraphInspector;
use crate::domain::scheduler::{Debouncer, ReentryGuard};

/// Sink values that mean "follow the default routing"
const AUTO_VALUES: [&str; 3] = ["", "auto", "__auto__"];

fn is_auto(sink: &str) -> bool {
    AUTO_VALUES.contains(&sink.trim())
}

/// Override table backed by the rig state
#[derive(Clone)]
pub struct RoutingOverrides {
    state: Arc<StateStore>,
}

impl RoutingOverrides {
    pub fn new(state: Arc<StateStore>) -> Self {
        Self { state }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.state.snapshot().await.overrides.get(key).cloned()
    }

    /// Record an override. An auto value clears it instead.
    pub async fn set(&self, key: &str, sink: &str) {
        if is_auto(sink) {
            self.clear(key).await;
            return;
        }
        info!(key, sink, "Routing override set");
        self.state
            .update(|s| s.overrides.insert(key.to_string(), sink.to_string()))
            .await;
    }

    pub async fn clear(&self, key: &str) -> bool {
        let removed = self
            .state
            .update(|s| s.overrides.remove(key))
            .await
            .is_some();
        if removed {
            info!(key, "Routing override cleared");
        }
        removed
    }

    pub async fn all(&self) -> BTreeMap<String, String> {
        self.state.snapshot().await.overrides
    }
}

/// Re-applies overrides when live placement drifts, at most once per
/// debounce window per key
pub struct OverrideEnforcer {
    control: Arc<dyn AudioControl>,
    inspector: Arc<GraphInspector>,
    overrides: RoutingOverrides,
    debouncer: Debouncer<String>,
    guard: ReentryGuard,
}

impl OverrideEnforcer {
    pub fn new(
        control: Arc<dyn AudioControl>,
        inspector: Arc<GraphInspector>,
        overrides: RoutingOverrides,
        debounce: Duration,
    ) -> Self {
        Self {
            control,
            inspector,
            overrides,
            debouncer: Debouncer::new(debounce),
            guard: ReentryGuard::new(),
        }
    }

    pub fn overrides(&self) -> &RoutingOverrides {
        &self.overrides
    }

    /// One polling pass. Returns the keys whose streams were moved.
    ///
    /// Skipped while a previous pass is still running and while the control
    /// tool is circuit-broken; skipped passes record nothing, so pending
    /// overrides are applied on the first pass after recovery.
    pub async fn enforce_pass(&self) -> Vec<String> {
        let Some(_token) = self.guard.try_enter() else {
            debug!("Override pass already running, skipped");
            return Vec::new();
        };
        if !self.control.status().available {
            debug!("Control tool unavailable, override pass skipped");
            return Vec::new();
        }

        let overrides = self.overrides.all().await;
        if overrides.is_empty() {
            return Vec::new();
        }
        let groups = self.inspector.list_client_streams().await;
        let live_sinks = self.inspector.live_sink_names().await;

        let mut moved = Vec::new();
        for group in groups {
            let Some(target) = overrides.get(&group.key) else {
                continue;
            };
            let drifted = group.ids_off(target);
            if drifted.is_empty() || !live_sinks.contains(target) {
                continue;
            }
            if !self.debouncer.try_fire(&group.key) {
                continue;
            }
            info!(
                key = %group.key,
                streams = drifted.len(),
                to = %target,
                "Re-applying routing override"
            );
            self.move_ids(&drifted, target).await;
            moved.push(group.key);
        }
        moved
    }

    /// Set an override and move the application's streams right away
    pub async fn apply_override(&self, key: &str, sink: &str) -> bool {
        self.overrides.set(key, sink).await;
        if is_auto(sink) {
            return true;
        }
        let groups = self.inspector.list_client_streams().await;
        let Some(group) = groups.into_iter().find(|g| g.key == key) else {
            debug!(key, "No live streams for override yet");
            return true;
        };
        self.debouncer.mark(&group.key);
        self.move_ids(&group.ids, sink).await
    }

    pub async fn clear_override(&self, key: &str) -> bool {
        self.debouncer.reset(&key.to_string());
        self.overrides.clear(key).await
    }

    async fn move_ids(&self, ids: &[StreamId], sink: &str) -> bool {
        let mut all_moved = true;
        for id in ids {
            all_moved &= self.control.move_client_stream(*id, sink).await;
        }
        all_moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::MemoryStore;
    use crate::domain::inspector::SelfIdentity;
    use crate::domain::registry::ResourceRegistry;
    use crate::testing::FakeAudioControl;

    async fn fixture() -> (Arc<FakeAudioControl>, OverrideEnforcer) {
        let control = Arc::new(FakeAudioControl::with_rig());
        let inspector = Arc::new(GraphInspector::new(
            control.clone(),
            Arc::new(ResourceRegistry::with_rig_devices()),
            SelfIdentity::default(),
        ));
        let state = Arc::new(StateStore::open(Arc::new(MemoryStore::new())).await);
        let enforcer = OverrideEnforcer::new(
            control.clone(),
            inspector,
            RoutingOverrides::new(state),
            Duration::from_millis(1500),
        );
        (control, enforcer)
    }

    #[tokio::test]
    async fn test_auto_clears_override() {
        let (_, enforcer) = fixture().await;
        let overrides = enforcer.overrides();
        overrides.set("firefox|firefox", "game").await;
        assert_eq!(overrides.get("firefox|firefox").await.as_deref(), Some("game"));
        overrides.set("firefox|firefox", "auto").await;
        assert_eq!(overrides.get("firefox|firefox").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_moved_once_per_window() {
        let (control, enforcer) = fixture().await;
        let id = control.add_app_stream(7, "Firefox", "firefox", "browser");
        let key = enforcer.inspector.list_client_streams().await[0].key.clone();
        enforcer.overrides().set(&key, "game").await;

        assert_eq!(enforcer.enforce_pass().await, vec![key.clone()]);
        assert_eq!(control.stream_sink(id).as_deref(), Some("game"));

        // The user drags it back in an external mixer; polling every 200ms
        control.place_stream(id, "browser");
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(200)).await;
            assert!(enforcer.enforce_pass().await.is_empty());
        }
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(enforcer.enforce_pass().await, vec![key]);
        assert_eq!(control.moves().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_stream_of_group_is_moved() {
        let (control, enforcer) = fixture().await;
        let first = control.add_app_stream(7, "Firefox", "firefox", "game");
        let key = enforcer.inspector.list_client_streams().await[0].key.clone();
        enforcer.overrides().set(&key, "game").await;
        assert!(enforcer.enforce_pass().await.is_empty());

        // A new tab opens on the default routing
        let second = control.add_app_stream(8, "Firefox", "firefox", "browser");
        let mut moved = 0;
        for _ in 0..10 {
            moved += enforcer.enforce_pass().await.len();
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        assert_eq!(moved, 1);
        assert_eq!(control.stream_sink(first).as_deref(), Some("game"));
        assert_eq!(control.stream_sink(second).as_deref(), Some("game"));
        assert_eq!(control.moves(), vec![(second, "game".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_tool_defers_enforcement() {
        let (control, enforcer) = fixture().await;
        let id = control.add_app_stream(7, "Firefox", "firefox", "browser");
        let key = enforcer.inspector.list_client_streams().await[0].key.clone();
        enforcer.overrides().set(&key, "chat").await;

        control.set_available(false);
        assert!(enforcer.enforce_pass().await.is_empty());
        control.set_available(true);
        assert_eq!(enforcer.enforce_pass().await.len(), 1);
        assert_eq!(control.stream_sink(id).as_deref(), Some("chat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_sink_not_enforced() {
        let (control, enforcer) = fixture().await;
        control.add_app_stream(7, "Firefox", "firefox", "browser");
        let key = enforcer.inspector.list_client_streams().await[0].key.clone();
        enforcer.overrides().set(&key, "unplugged_dac").await;
        assert!(enforcer.enforce_pass().await.is_empty());
        assert!(control.moves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_override_moves_immediately() {
        let (control, enforcer) = fixture().await;
        let id = control.add_app_stream(7, "Firefox", "firefox", "browser");
        let key = enforcer.inspector.list_client_streams().await[0].key.clone();

        assert!(enforcer.apply_override(&key, "game").await);
        assert_eq!(control.stream_sink(id).as_deref(), Some("game"));
        assert!(enforcer.enforce_pass().await.is_empty());
        assert!(enforcer.clear_override(&key).await);
    }
}
