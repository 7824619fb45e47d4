use mixrig_core::domain::audio::AudioControl;
use mixrig_core::domain::config::{ConfigStore, DaemonConfig, MemoryStore, PathsConfig, RigState};
use mixrig_core::domain::rig::RigService;
use mixrig_core::testing::{FakeAudioControl, ScriptedCapture};
use std::sync::Arc;
use tempfile::TempDir;

pub fn config_in(dir: &TempDir) -> DaemonConfig {
    DaemonConfig {
        paths: PathsConfig {
            state_dir: dir.path().join("state"),
            engine_conf_dir: dir.path().join("engine"),
            pulse_conf_dir: dir.path().join("pulse"),
        },
        ..Default::default()
    }
}

pub async fn rig_on(
    dir: &TempDir,
    control: Arc<dyn AudioControl>,
    store: Arc<dyn ConfigStore>,
) -> Arc<RigService> {
    Arc::new(
        RigService::new(
            config_in(dir),
            control,
            Arc::new(ScriptedCapture::new()),
            store,
        )
        .await,
    )
}

/// Rig over the fake graph, starting from `state`
pub async fn fake_rig(state: RigState) -> (Arc<FakeAudioControl>, Arc<RigService>, TempDir) {
    let dir = TempDir::new().unwrap();
    let control = Arc::new(FakeAudioControl::with_rig());
    let rig = rig_on(&dir, control.clone(), Arc::new(MemoryStore::with_state(state))).await;
    (control, rig, dir)
}
