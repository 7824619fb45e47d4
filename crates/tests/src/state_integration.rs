//! Persistence of the rig state through real files

use crate::common::{config_in, rig_on};
use mixrig_core::domain::config::{JsonFileStore, RigState};
use mixrig_core::testing::FakeAudioControl;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_routing_survives_daemon_restart() {
    let dir = TempDir::new().unwrap();
    let state_path = config_in(&dir).state_path();
    let control = Arc::new(FakeAudioControl::with_rig());

    {
        let rig = rig_on(&dir, control.clone(), Arc::new(JsonFileStore::new(state_path.clone()))).await;
        rig.set_link("game.monitor", "hw1").await;
        rig.set_lan_enabled(true).await;
    }

    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&state_path).unwrap()).unwrap();
    assert_eq!(written["loopbacks"]["game.monitor"], "hw1");

    let rig = rig_on(&dir, control, Arc::new(JsonFileStore::new(state_path))).await;
    let state = rig.state().await;
    assert_eq!(state.loopbacks.get("game.monitor").map(String::as_str), Some("hw1"));
    assert!(state.lan_enabled);
}

#[tokio::test]
async fn test_malformed_state_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let state_path = config_in(&dir).state_path();
    std::fs::create_dir_all(state_path.parent().unwrap()).unwrap();
    std::fs::write(&state_path, "{ not json").unwrap();

    let rig = rig_on(
        &dir,
        Arc::new(FakeAudioControl::with_rig()),
        Arc::new(JsonFileStore::new(state_path.clone())),
    )
    .await;
    assert_eq!(rig.state().await, RigState::default());
    assert!(state_path.with_extension("json.corrupt").exists());
}

#[tokio::test]
async fn test_external_edit_is_reconciled() {
    let dir = TempDir::new().unwrap();
    let state_path = config_in(&dir).state_path();
    let control = Arc::new(FakeAudioControl::with_rig());
    let rig = rig_on(&dir, control.clone(), Arc::new(JsonFileStore::new(state_path.clone()))).await;
    rig.set_link("game.monitor", "hw0").await;

    let mut edited = rig.state().await;
    edited.loopbacks.insert("game.monitor".to_string(), "hw1".to_string());
    std::fs::write(&state_path, serde_json::to_vec_pretty(&edited).unwrap()).unwrap();

    assert!(rig.on_state_file_changed().await);
    assert!(control.has_link("game.monitor", "hw1"));
    assert!(!control.has_link("game.monitor", "hw0"));
    // Nothing changed since the reload
    assert!(!rig.on_state_file_changed().await);
}

#[tokio::test]
async fn test_truncated_state_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    let state_path = config_in(&dir).state_path();
    let control = Arc::new(FakeAudioControl::with_rig());
    let rig = rig_on(&dir, control.clone(), Arc::new(JsonFileStore::new(state_path.clone()))).await;
    rig.set_link("game.monitor", "hw1").await;
    rig.set_lan_enabled(true).await;
    let written = std::fs::read(&state_path).unwrap();

    std::fs::write(&state_path, "").unwrap();
    assert!(!rig.on_state_file_changed().await);

    let state = rig.state().await;
    assert_eq!(state.loopbacks.get("game.monitor").map(String::as_str), Some("hw1"));
    assert!(state.lan_enabled);
    assert!(control.has_link("game.monitor", "hw1"));
    // The daemon did not overwrite the file with defaults
    assert!(std::fs::read(&state_path).unwrap().is_empty());

    // Once the editor finishes writing, the content is picked up again
    std::fs::write(&state_path, &written).unwrap();
    assert!(!rig.on_state_file_changed().await);
}
