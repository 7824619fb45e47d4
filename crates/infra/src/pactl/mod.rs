//! Audio control through the `pactl` command-line client
//!
//! Every call goes through the shared [`CommandGateway`], so a failing
//! `pactl` trips the circuit breaker for all callers at once.

pub mod parse;

use async_trait::async_trait;
use mixrig_core::domain::audio::{
    AudioControl, ClientStream, DeviceEntry, GatewayStatus, ModuleEntry, ModuleId,
    RestartOutcome, StreamId,
};
use mixrig_core::domain::gateway::{CommandGateway, CommandOutput};
use std::sync::Arc;
use tracing::debug;

use parse::{
    parse_devices, parse_module_id, parse_short_index_map, parse_short_modules,
    parse_sink_inputs, SINK_HEADER, SOURCE_HEADER,
};

pub struct PactlControl {
    gateway: Arc<CommandGateway>,
    program: String,
}

impl PactlControl {
    pub fn new(gateway: Arc<CommandGateway>) -> Self {
        let program = gateway.policy().gated_tool.clone();
        Self { gateway, program }
    }

    /// Use a specific `pactl` binary. It must still match the gateway's
    /// gated tool to be circuit-broken.
    pub fn with_program(gateway: Arc<CommandGateway>, program: impl Into<String>) -> Self {
        Self {
            gateway,
            program: program.into(),
        }
    }

    pub fn gateway(&self) -> &Arc<CommandGateway> {
        &self.gateway
    }

    async fn pactl<S: AsRef<str>>(&self, args: &[S]) -> CommandOutput {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.gateway.execute(&self.program, &args).await
    }

    async fn listing(&self, args: &[&str]) -> Option<String> {
        let output = self.pactl(args).await;
        output.ok.then_some(output.stdout)
    }

    async fn non_empty(&self, args: &[&str]) -> Option<String> {
        self.listing(args).await.filter(|s| !s.is_empty())
    }
}

fn percent(value: u32) -> String {
    format!("{}%", value)
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

#[async_trait]
impl AudioControl for PactlControl {
    async fn sinks(&self) -> Vec<DeviceEntry> {
        self.listing(&["list", "sinks"])
            .await
            .map(|text| parse_devices(&text, SINK_HEADER))
            .unwrap_or_default()
    }

    async fn sources(&self) -> Vec<DeviceEntry> {
        self.listing(&["list", "sources"])
            .await
            .map(|text| parse_devices(&text, SOURCE_HEADER))
            .unwrap_or_default()
    }

    async fn client_streams(&self) -> Vec<ClientStream> {
        let Some(text) = self.listing(&["list", "sink-inputs"]).await else {
            return Vec::new();
        };
        let sinks = self
            .listing(&["list", "short", "sinks"])
            .await
            .map(|t| parse_short_index_map(&t))
            .unwrap_or_default();
        parse_sink_inputs(&text, &sinks)
    }

    async fn modules(&self) -> Vec<ModuleEntry> {
        self.listing(&["list", "short", "modules"])
            .await
            .map(|text| parse_short_modules(&text))
            .unwrap_or_default()
    }

    async fn load_module(&self, name: &str, args: &[String]) -> Option<ModuleId> {
        let mut call = vec!["load-module".to_string(), name.to_string()];
        call.extend(args.iter().cloned());
        let output = self.pactl(&call).await;
        if !output.ok {
            return None;
        }
        let id = parse_module_id(&output.stdout);
        if id.is_none() {
            debug!(module = name, stdout = %output.stdout, "load-module printed no index");
        }
        id
    }

    async fn unload_module(&self, id: ModuleId) -> bool {
        self.pactl(&["unload-module".to_string(), id.to_string()])
            .await
            .ok
    }

    async fn default_sink(&self) -> Option<String> {
        self.non_empty(&["get-default-sink"]).await
    }

    async fn default_source(&self) -> Option<String> {
        self.non_empty(&["get-default-source"]).await
    }

    async fn set_default_sink(&self, sink: &str) -> bool {
        self.pactl(&["set-default-sink", sink]).await.ok
    }

    async fn set_default_source(&self, source: &str) -> bool {
        self.pactl(&["set-default-source", source]).await.ok
    }

    async fn move_client_stream(&self, id: StreamId, sink: &str) -> bool {
        let id = id.to_string();
        self.pactl(&["move-sink-input", id.as_str(), sink]).await.ok
    }

    async fn set_sink_volume(&self, sink: &str, percent_value: u32) -> bool {
        let volume = percent(percent_value);
        self.pactl(&["set-sink-volume", sink, volume.as_str()])
            .await
            .ok
    }

    async fn set_sink_mute(&self, sink: &str, muted: bool) -> bool {
        self.pactl(&["set-sink-mute", sink, flag(muted)]).await.ok
    }

    async fn set_source_volume(&self, source: &str, percent_value: u32) -> bool {
        let volume = percent(percent_value);
        self.pactl(&["set-source-volume", source, volume.as_str()])
            .await
            .ok
    }

    async fn set_client_stream_volume(&self, id: StreamId, percent_value: u32) -> bool {
        let (id, volume) = (id.to_string(), percent(percent_value));
        self.pactl(&["set-sink-input-volume", id.as_str(), volume.as_str()])
            .await
            .ok
    }

    async fn set_client_stream_mute(&self, id: StreamId, muted: bool) -> bool {
        let id = id.to_string();
        self.pactl(&["set-sink-input-mute", id.as_str(), flag(muted)])
            .await
            .ok
    }

    async fn restart_backend(&self, units: &[&str]) -> RestartOutcome {
        self.gateway.restart(units).await
    }

    fn status(&self) -> GatewayStatus {
        self.gateway.status()
    }
}
