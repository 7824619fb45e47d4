//! The `pactl` adapter behind the command gateway, over scripted processes

use crate::common::rig_on;
use mixrig_core::domain::config::MemoryStore;
use mixrig_core::domain::gateway::{CommandGateway, GatewayPolicy, ProcessOutput};
use mixrig_core::domain::inspector::ListMode;
use mixrig_core::testing::ScriptedRunner;
use mixrig_infra::PactlControl;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SINKS: &str = "Sink #47
\tState: RUNNING
\tName: hw0
\tDescription: Built-in Audio Analog Stereo
\tOwner Module: 4294967295
";

fn pactl_over(runner: &Arc<ScriptedRunner>) -> Arc<PactlControl> {
    let gateway = Arc::new(CommandGateway::new(runner.clone(), GatewayPolicy::default()));
    Arc::new(PactlControl::new(gateway))
}

#[tokio::test(start_paused = true)]
async fn test_failed_call_short_circuits_until_cooldown() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let rig = rig_on(&dir, pactl_over(&runner), Arc::new(MemoryStore::new())).await;

    runner.push(ProcessOutput::failed(1, "Connection failure: Connection refused"));
    assert!(rig.sinks(ListMode::Raw).await.is_empty());
    let spawned = runner.call_count();

    // Every caller sees the open circuit without spawning anything
    assert!(rig.sources(ListMode::Raw).await.is_empty());
    assert!(rig.client_streams().await.is_empty());
    assert!(!rig.set_sink_volume("hw0", 80.0).await);
    assert_eq!(runner.call_count(), spawned);

    let status = rig.status().await.gateway;
    assert!(!status.available);
    assert!(status.last_error.contains("Connection refused"));
    assert_eq!(status.retry_in_secs, 5);

    tokio::time::advance(Duration::from_secs(5)).await;
    runner.on(&["list", "sinks"], ProcessOutput::ok(SINKS));
    let sinks = rig.sinks(ListMode::Raw).await;
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks[0].name, "hw0");
    assert!(rig.status().await.gateway.available);
}

#[tokio::test(start_paused = true)]
async fn test_restart_request_within_cooldown_is_refused() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let rig = rig_on(&dir, pactl_over(&runner), Arc::new(MemoryStore::new())).await;

    assert!(rig.restart_audio().await.restarted());
    let restarts = |runner: &ScriptedRunner| {
        runner
            .calls()
            .iter()
            .filter(|(program, _)| program.ends_with("systemctl"))
            .count()
    };
    assert_eq!(restarts(&runner), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    let outcome = rig.restart_audio().await;
    assert!(!outcome.restarted());
    assert_eq!(restarts(&runner), 1);
    assert_eq!(
        serde_json::to_value(outcome).unwrap()["outcome"],
        "not_yet"
    );
}
