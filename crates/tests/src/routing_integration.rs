//! Link reconciliation, overrides and stream mode through the rig service

use crate::common::fake_rig;
use mixrig_core::domain::audio::StreamId;
use mixrig_core::domain::config::RigState;
use mixrig_core::domain::filter_chain::{DescriptorKind, MicFilterSettings};
use mixrig_core::domain::reconciler::{ApplyOptions, LinkPlan};
use std::time::Duration;

fn plan(entries: &[(&str, &str)]) -> LinkPlan {
    entries
        .iter()
        .map(|(s, k)| (s.to_string(), k.to_string()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_desired_links_created_and_persisted() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    let desired = plan(&[
        ("browser.monitor", "hw0"),
        ("game.monitor", "hw0"),
        ("chat.monitor", "hw0"),
    ]);

    let report = rig
        .reconciler()
        .apply_desired_links(desired.clone(), ApplyOptions::immediate())
        .await;

    assert_eq!(report.created.len(), 3);
    for source in desired.keys() {
        assert_eq!(control.links_from(source).len(), 1);
    }
    assert_eq!(rig.state().await.loopbacks, desired);
}

#[tokio::test(start_paused = true)]
async fn test_retarget_touches_only_changed_link() {
    let mut state = RigState::default();
    state.loopbacks = plan(&[("browser.monitor", "hw1"), ("chat.monitor", "hw0")]);
    let (control, rig, _dir) = fake_rig(state).await;
    let old_browser = control.load_link("browser.monitor", "hw1");
    let chat = control.load_link("chat.monitor", "hw0");

    let report = rig.set_link("browser.monitor", "hw0").await;

    assert_eq!(report.destroyed.len(), 1);
    assert_eq!(report.destroyed[0].handle, old_browser);
    assert_eq!(report.created.len(), 1);
    assert!(control.has_module(chat));
    assert!(control.has_link("browser.monitor", "hw0"));
    assert!(!control.has_module(old_browser));
}

#[tokio::test(start_paused = true)]
async fn test_reapplying_same_plan_changes_nothing() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    let desired = plan(&[("browser.monitor", "hw0"), ("game.monitor", "hw1")]);
    rig.reconciler()
        .apply_desired_links(desired.clone(), ApplyOptions::default())
        .await;
    control.reset_calls();

    let report = rig
        .reconciler()
        .apply_desired_links(desired, ApplyOptions::default())
        .await;

    assert!(report.is_noop());
    assert_eq!(control.load_count(), 0);
    assert_eq!(control.unload_count(), 0);
    assert!(control.restarts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mic_monitor_never_played_back() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    rig.reconciler()
        .apply_desired_links(
            plan(&[("mic.monitor", "hw0"), ("game.monitor", "hw0")]),
            ApplyOptions::immediate(),
        )
        .await;
    assert!(control.links_from("mic.monitor").is_empty());
    assert!(!rig.state().await.loopbacks.contains_key("mic.monitor"));
}

#[tokio::test(start_paused = true)]
async fn test_override_converges_after_drift() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    let id = control.add_app_stream(41, "Firefox", "firefox", "browser");
    let key = rig.client_streams().await[0].key.clone();

    assert!(rig.set_override(&key, "game").await);
    assert_eq!(control.stream_sink(id).as_deref(), Some("game"));

    // Dragged back by another mixer; held off until the debounce window passes
    control.place_stream(id, "browser");
    assert!(rig.enforce_overrides().await.is_empty());
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(rig.enforce_overrides().await, vec![key.clone()]);
    assert_eq!(control.stream_sink(id).as_deref(), Some("game"));

    assert!(rig.clear_override(&key).await);
    control.place_stream(id, "browser");
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(rig.enforce_overrides().await.is_empty());
    assert_eq!(control.stream_sink(id).as_deref(), Some("browser"));
}

#[tokio::test(start_paused = true)]
async fn test_default_sink_moves_default_links() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    rig.startup().await;
    assert!(control.has_link("game.monitor", "hw0"));

    rig.set_all_channel_links("hw1").await;
    for source in ["browser.monitor", "game.monitor", "soundboard.monitor"] {
        assert!(control.has_link(source, "hw1"));
        assert!(!control.has_link(source, "hw0"));
    }
    assert!(rig.set_default_sink("mic").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stream_mode_links() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    assert!(rig.set_stream_link("game", true).await);
    assert!(control.has_link("game.monitor", "stream"));

    let outcome = rig.set_stream_output(Some("hw1".to_string())).await;
    assert!(outcome.restarted());
    assert!(control.has_link("stream.monitor", "hw1"));
    // The stream mix survives the restart that applied the output
    assert!(control.has_link("game.monitor", "stream"));

    assert_eq!(rig.clear_stream_output().await, 1);
    assert!(control.links_from("stream.monitor").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_mic_effects_remove_chain() {
    let (_, rig, _dir) = fake_rig(RigState::default()).await;
    let descriptors = rig.reconciler().descriptors();

    let active = MicFilterSettings {
        noise_suppression: true,
        ..Default::default()
    };
    rig.apply_filter_settings(active, Default::default(), true)
        .await;
    assert!(descriptors.exists(DescriptorKind::MicChain));
    assert!(descriptors.exists(DescriptorKind::ChatChain));

    rig.apply_filter_settings(MicFilterSettings::default(), Default::default(), true)
        .await;
    assert!(!descriptors.exists(DescriptorKind::MicChain));
    assert!(descriptors.exists(DescriptorKind::ChatChain));
}

#[tokio::test]
async fn test_soundboard_events_drain_in_order() {
    let (_, rig, _dir) = fake_rig(RigState::default()).await;
    for slot in 0..100 {
        rig.soundboard().play(Some(slot), Some(1));
    }
    let events = rig.soundboard().drain();
    assert_eq!(events.len(), 100);
    assert!(events
        .iter()
        .enumerate()
        .all(|(i, e)| e.slot_index == Some(i as u32)));
    assert!(rig.soundboard().drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_route_sinks_and_manual_move() {
    let (control, rig, _dir) = fake_rig(RigState::default()).await;
    let names: Vec<_> = rig.route_sinks().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["browser", "game", "chat", "soundboard", "stream"]);

    let a = control.add_app_stream(7, "Firefox", "firefox", "hw0");
    let b = control.add_app_stream(8, "Firefox", "firefox", "hw0");
    assert!(rig.move_streams(&[a, b], "browser").await);
    assert_eq!(control.stream_sink(a).as_deref(), Some("browser"));
    assert_eq!(control.stream_sink(b).as_deref(), Some("browser"));

    assert!(!rig.move_streams(&[StreamId(99)], "game").await);
    assert_eq!(control.stream_sink(a).as_deref(), Some("browser"));
}
