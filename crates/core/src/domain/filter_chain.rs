//! Filter chain builder and engine descriptor artifacts
//!
//! Noise-suppression and gate settings are turned into a typed [`FilterChain`]
//! graph, then rendered wholesale into the engine's declarative config syntax.
//! Descriptors are never patched: every commit rewrites (or removes) the whole
//! file, and an engine reload is required for it to take effect.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::domain::audio::{names, LinkRecord};
use crate::domain::config::Result;

const RNNOISE_PLUGIN: &str = "https://github.com/werman/noise-suppression-for-voice";
const GATE_MONO_PLUGIN: &str = "http://lsp-plug.in/plugins/lv2/gate_mono";
const GATE_STEREO_PLUGIN: &str = "http://lsp-plug.in/plugins/lv2/gate_lr";

/// Map the 0–100 UI gate threshold onto engine units, `10^(-3 + pct/100 * 3)`
/// rounded to 6 decimals. Out-of-range input is clamped, NaN counts as 0.
pub fn map_gate_threshold(percent: f64) -> f64 {
    let clamped = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let value = 10f64.powf(-3.0 + (clamped / 100.0) * 3.0);
    (value * 1e6).round() / 1e6
}

/// Noise suppressor engine variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSuppressor {
    #[default]
    Rnnoise,
    Off,
}

/// Filter settings for the microphone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicFilterSettings {
    pub noise_suppression: bool,
    pub suppressor: NoiseSuppressor,
    pub gate_enabled: bool,
    /// 0–100 UI scale
    pub gate_threshold: f64,
    /// Global switch for all mic effects
    pub fx_enabled: bool,
}

impl Default for MicFilterSettings {
    fn default() -> Self {
        Self {
            noise_suppression: false,
            suppressor: NoiseSuppressor::Rnnoise,
            gate_enabled: false,
            gate_threshold: 45.0,
            fx_enabled: true,
        }
    }
}

impl MicFilterSettings {
    /// Whether the FX source exists at all
    pub fn is_active(&self) -> bool {
        self.fx_enabled && (self.noise_suppression || self.gate_enabled)
    }
}

/// Filter settings for the chat channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatFilterSettings {
    pub noise_suppression: bool,
    pub suppressor: NoiseSuppressor,
    pub gate_enabled: bool,
    pub gate_threshold: f64,
    /// Force the gate on for live audition, without persisting the flag
    #[serde(skip)]
    pub gate_test: bool,
    /// Wet share of the dry/wet chat mix, 0–100
    pub mix: f64,
}

impl Default for ChatFilterSettings {
    fn default() -> Self {
        Self {
            noise_suppression: false,
            suppressor: NoiseSuppressor::Rnnoise,
            gate_enabled: false,
            gate_threshold: 45.0,
            gate_test: false,
            mix: 100.0,
        }
    }
}

impl ChatFilterSettings {
    pub fn is_active(&self) -> bool {
        self.noise_suppression || self.gate_enabled
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Lv2 { plugin: String },
    Builtin { label: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
struct FilterNode {
    name: &'static str,
    kind: NodeKind,
    controls: Vec<(&'static str, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeProps {
    name: &'static str,
    description: Option<&'static str>,
    media_class: Option<&'static str>,
    passive_default_source: bool,
}

/// Typed filter graph for the engine's filter-chain module
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    description: &'static str,
    channels: u8,
    nodes: Vec<FilterNode>,
    links: Vec<(String, String)>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    capture: NodeProps,
    playback: NodeProps,
}

impl FilterChain {
    /// Mono chain capturing the default source into the FX source.
    /// `None` when mic effects are disabled.
    pub fn mic(settings: &MicFilterSettings) -> Option<Self> {
        if !settings.is_active() {
            return None;
        }
        let rnnoise_on = settings.noise_suppression && settings.suppressor != NoiseSuppressor::Off;
        let nodes = vec![
            FilterNode {
                name: "rnnoise",
                kind: NodeKind::Lv2 {
                    plugin: format!("{}#mono", RNNOISE_PLUGIN),
                },
                controls: vec![("enabled", bool_control(rnnoise_on))],
            },
            FilterNode {
                name: "gate",
                kind: NodeKind::Lv2 {
                    plugin: GATE_MONO_PLUGIN.to_string(),
                },
                controls: vec![
                    ("enabled", bool_control(settings.gate_enabled)),
                    ("gt", map_gate_threshold(settings.gate_threshold)),
                ],
            },
        ];
        Some(Self {
            description: "Mixrig Mic FX",
            channels: 1,
            nodes,
            links: vec![("rnnoise:audio_out_1".into(), "gate:in".into())],
            inputs: vec!["rnnoise:audio_in_1".into()],
            outputs: vec!["gate:out".into()],
            capture: NodeProps {
                name: names::MIC_FX_CAPTURE,
                description: None,
                media_class: None,
                passive_default_source: true,
            },
            playback: NodeProps {
                name: names::MIC_FX_SOURCE,
                description: Some("Mixrig Mic FX"),
                media_class: Some("Audio/Source"),
                passive_default_source: false,
            },
        })
    }

    /// Stereo chain between the chat FX input sink and output source. Always
    /// present; without a suppressor it is a pair of copy nodes.
    pub fn chat(settings: &ChatFilterSettings) -> Self {
        let rnnoise_on = settings.noise_suppression && settings.suppressor != NoiseSuppressor::Off;
        let with_gate = settings.gate_enabled || settings.gate_test;
        let threshold = map_gate_threshold(settings.gate_threshold);

        let mut nodes = Vec::new();
        let (head_l, head_r, inputs) = if rnnoise_on {
            nodes.push(FilterNode {
                name: "rnnoise",
                kind: NodeKind::Lv2 {
                    plugin: format!("{}#stereo", RNNOISE_PLUGIN),
                },
                controls: vec![("enabled", 1.0)],
            });
            (
                "rnnoise:audio_out_1",
                "rnnoise:audio_out_2",
                vec!["rnnoise:audio_in_1".to_string(), "rnnoise:audio_in_2".to_string()],
            )
        } else {
            for name in ["copyL", "copyR"] {
                nodes.push(FilterNode {
                    name,
                    kind: NodeKind::Builtin { label: "copy" },
                    controls: Vec::new(),
                });
            }
            (
                "copyL:Out",
                "copyR:Out",
                vec!["copyL:In".to_string(), "copyR:In".to_string()],
            )
        };

        let (links, outputs) = if with_gate {
            nodes.push(FilterNode {
                name: "gate",
                kind: NodeKind::Lv2 {
                    plugin: GATE_STEREO_PLUGIN.to_string(),
                },
                controls: vec![
                    ("enabled", bool_control(settings.gate_test || settings.gate_enabled)),
                    ("gt_l", threshold),
                    ("gt_r", threshold),
                ],
            });
            (
                vec![
                    (head_l.to_string(), "gate:in_l".to_string()),
                    (head_r.to_string(), "gate:in_r".to_string()),
                ],
                vec!["gate:out_l".to_string(), "gate:out_r".to_string()],
            )
        } else {
            (Vec::new(), vec![head_l.to_string(), head_r.to_string()])
        };

        Self {
            description: "Mixrig Chat Filter",
            channels: 2,
            nodes,
            links,
            inputs,
            outputs,
            capture: NodeProps {
                name: names::CHAT_FX_INPUT,
                description: Some("Chat FX Input"),
                media_class: Some("Audio/Sink"),
                passive_default_source: false,
            },
            playback: NodeProps {
                name: names::CHAT_FX_OUTPUT,
                description: Some("Chat FX Output"),
                media_class: Some("Audio/Source"),
                passive_default_source: false,
            },
        }
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Value of a node control, if present
    pub fn control(&self, node: &str, control: &str) -> Option<f64> {
        self.nodes
            .iter()
            .find(|n| n.name == node)?
            .controls
            .iter()
            .find(|(k, _)| *k == control)
            .map(|(_, v)| *v)
    }

    /// Render as an engine `context.modules` fragment
    pub fn render(&self) -> String {
        let mut out = String::new();
        let position = if self.channels == 1 { "MONO" } else { "FL FR" };
        let _ = writeln!(out, "# {}", self.description);
        out.push_str("context.modules = [\n");
        out.push_str("  { name = libpipewire-module-filter-chain\n");
        out.push_str("    flags = [ nofail ]\n");
        out.push_str("    args = {\n");
        let _ = writeln!(out, "      node.description = \"{}\"", self.description);
        let _ = writeln!(out, "      media.name       = \"{}\"", self.description);
        let _ = writeln!(out, "      audio.channels   = {}", self.channels);
        out.push_str("      audio.rate       = 48000\n");
        let _ = writeln!(out, "      audio.position   = [ {} ]", position);
        out.push_str("      filter.graph = {\n");
        out.push_str("        nodes = [\n");
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Builtin { label } => {
                    let _ = writeln!(
                        out,
                        "          {{ type = builtin label = {} name = {} }}",
                        label, node.name
                    );
                }
                NodeKind::Lv2 { plugin } => {
                    out.push_str("          {\n");
                    out.push_str("            type   = lv2\n");
                    let _ = writeln!(out, "            name   = {}", node.name);
                    let _ = writeln!(out, "            plugin = \"{}\"", plugin);
                    out.push_str("            control = {\n");
                    for (key, value) in &node.controls {
                        let _ = writeln!(out, "              {} = {}", key, value);
                    }
                    out.push_str("            }\n");
                    out.push_str("          }\n");
                }
            }
        }
        out.push_str("        ]\n");
        if self.links.is_empty() {
            out.push_str("        links = [ ]\n");
        } else {
            out.push_str("        links = [\n");
            for (from, to) in &self.links {
                let _ = writeln!(out, "          {{ output = \"{}\" input = \"{}\" }}", from, to);
            }
            out.push_str("        ]\n");
        }
        let _ = writeln!(out, "        inputs  = [ {} ]", quoted_list(&self.inputs));
        let _ = writeln!(out, "        outputs = [ {} ]", quoted_list(&self.outputs));
        out.push_str("      }\n");
        render_props(&mut out, "capture.props", &self.capture);
        render_props(&mut out, "playback.props", &self.playback);
        out.push_str("    }\n");
        out.push_str("  }\n");
        out.push_str("]\n");
        out
    }
}

fn bool_control(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

fn quoted_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("\"{}\"", i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_props(out: &mut String, key: &str, props: &NodeProps) {
    let _ = writeln!(out, "      {} = {{", key);
    let _ = writeln!(out, "        node.name    = \"{}\"", props.name);
    if let Some(description) = props.description {
        let _ = writeln!(out, "        node.description = \"{}\"", description);
    }
    if let Some(class) = props.media_class {
        let _ = writeln!(out, "        media.class = {}", class);
    }
    if props.passive_default_source {
        out.push_str("        node.passive = true\n");
        out.push_str("        target.object = \"@DEFAULT_SOURCE@\"\n");
    }
    out.push_str("      }\n");
}

/// Which artifact a descriptor is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    MicChain,
    ChatChain,
    LinkBootstrap,
    StreamOutput,
    MicSink,
    MicSource,
}

impl DescriptorKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            DescriptorKind::MicChain => "99-mixrig-mic.conf",
            DescriptorKind::ChatChain => "98-mixrig-chat.conf",
            DescriptorKind::LinkBootstrap => "91-mixrig-links.conf",
            DescriptorKind::StreamOutput => "95-mixrig-stream-output.conf",
            DescriptorKind::MicSink => "90-mixrig-mic.conf",
            DescriptorKind::MicSource => "89-mixrig-mic-source.conf",
        }
    }

    /// Filter chains are read by the engine itself, everything else by the
    /// pulse compatibility server
    pub fn is_engine_level(&self) -> bool {
        matches!(self, DescriptorKind::MicChain | DescriptorKind::ChatChain)
    }
}

/// A rendered artifact. `body == None` means the file must not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub body: Option<String>,
}

impl Descriptor {
    pub fn write(kind: DescriptorKind, body: String) -> Self {
        Self {
            kind,
            body: Some(body),
        }
    }

    pub fn remove(kind: DescriptorKind) -> Self {
        Self { kind, body: None }
    }
}

/// Mic chain descriptor; a removal when mic effects are off
pub fn render_mic_chain(settings: &MicFilterSettings) -> Descriptor {
    match FilterChain::mic(settings) {
        Some(chain) => Descriptor::write(DescriptorKind::MicChain, chain.render()),
        None => Descriptor::remove(DescriptorKind::MicChain),
    }
}

pub fn render_chat_chain(settings: &ChatFilterSettings) -> Descriptor {
    Descriptor::write(DescriptorKind::ChatChain, FilterChain::chat(settings).render())
}

fn pulse_cmd_list(comment: &str, modules: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", comment);
    out.push_str("pulse.cmd = [\n");
    for args in modules {
        let _ = writeln!(out, "  {{ cmd = \"load-module\" args = \"{}\" }}", args);
    }
    out.push_str("]\n");
    out
}

fn loopback_args(source: &str, sink: &str, latency_msec: u32) -> String {
    format!(
        "{} {}",
        names::LOOPBACK_MODULE,
        LinkRecord::module_args(source, sink, latency_msec).join(" ")
    )
}

/// Startup link list so links survive a backend restart. Empty targets and
/// the mic monitor are skipped.
pub fn render_link_bootstrap<'a, I>(links: I, latency_msec: u32) -> Descriptor
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mic_monitor = format!("{}{}", names::MIC_SINK, names::MONITOR_SUFFIX);
    let modules: Vec<String> = links
        .into_iter()
        .filter(|(source, sink)| !sink.is_empty() && **source != mic_monitor)
        .map(|(source, sink)| loopback_args(source, sink, latency_msec))
        .collect();
    Descriptor::write(
        DescriptorKind::LinkBootstrap,
        pulse_cmd_list("Mixrig loopbacks (virtual sinks to physical output)", &modules),
    )
}

/// Stream monitor to an output sink, or an empty list
pub fn render_stream_output(sink: Option<&str>, latency_msec: u32) -> Descriptor {
    let stream_monitor = format!("{}{}", names::STREAM_SINK, names::MONITOR_SUFFIX);
    let modules: Vec<String> = sink
        .filter(|s| !s.is_empty())
        .map(|s| loopback_args(&stream_monitor, s, latency_msec))
        .into_iter()
        .collect();
    Descriptor::write(
        DescriptorKind::StreamOutput,
        pulse_cmd_list("Mixrig stream monitor output", &modules),
    )
}

/// Arguments that create the virtual mic sink
pub fn mic_sink_args() -> Vec<String> {
    vec![
        format!("sink_name={}", names::MIC_SINK),
        "sink_properties=device.description=Mixrig\\ Mic".to_string(),
    ]
}

/// Arguments that create the virtual mic source over the mic sink monitor
pub fn mic_source_args() -> Vec<String> {
    vec![
        format!("master={}{}", names::MIC_SINK, names::MONITOR_SUFFIX),
        format!("source_name={}", names::MIC_SOURCE),
        "source_properties=device.description=Mixrig\\ Mic\\ Input".to_string(),
    ]
}

pub fn render_mic_sink() -> Descriptor {
    let args = format!(
        "{} sink_name={} sink_properties=device.description=\\\"Mixrig Mic\\\"",
        names::NULL_SINK_MODULE,
        names::MIC_SINK
    );
    Descriptor::write(
        DescriptorKind::MicSink,
        pulse_cmd_list("Mixrig virtual mic sink", &[args]),
    )
}

pub fn render_mic_source() -> Descriptor {
    let args = format!(
        "{} master={}{} source_name={} source_properties=device.description=\\\"Mixrig Mic Input\\\"",
        names::REMAP_SOURCE_MODULE,
        names::MIC_SINK,
        names::MONITOR_SUFFIX,
        names::MIC_SOURCE
    );
    Descriptor::write(
        DescriptorKind::MicSource,
        pulse_cmd_list("Mixrig virtual mic source", &[args]),
    )
}

/// Writes descriptors into the engine's drop-in directories
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    engine_dir: PathBuf,
    pulse_dir: PathBuf,
}

impl DescriptorStore {
    pub fn new(engine_dir: PathBuf, pulse_dir: PathBuf) -> Self {
        Self {
            engine_dir,
            pulse_dir,
        }
    }

    pub fn path_of(&self, kind: DescriptorKind) -> PathBuf {
        let dir = if kind.is_engine_level() {
            &self.engine_dir
        } else {
            &self.pulse_dir
        };
        dir.join(kind.file_name())
    }

    pub fn exists(&self, kind: DescriptorKind) -> bool {
        self.path_of(kind).exists()
    }

    /// Rewrite or remove the artifact in full
    #[instrument(skip(self, descriptor), fields(kind = ?descriptor.kind))]
    pub async fn commit(&self, descriptor: &Descriptor) -> Result<()> {
        let path = self.path_of(descriptor.kind);
        match &descriptor.body {
            Some(body) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, body).await?;
                debug!(path = %path.display(), "Descriptor written");
            }
            None => self.remove_file(&path).await?,
        }
        Ok(())
    }

    /// Write only when the artifact does not exist yet
    pub async fn commit_if_absent(&self, descriptor: &Descriptor) -> Result<bool> {
        if self.exists(descriptor.kind) {
            return Ok(false);
        }
        self.commit(descriptor).await?;
        Ok(true)
    }

    pub async fn remove(&self, kind: DescriptorKind) -> Result<()> {
        self.remove_file(&self.path_of(kind)).await
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Descriptor removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_gate_threshold_endpoints() {
        assert_eq!(map_gate_threshold(0.0), 0.001);
        assert_eq!(map_gate_threshold(100.0), 1.0);
        assert_eq!(map_gate_threshold(50.0), 0.031623);
        assert_eq!(map_gate_threshold(-20.0), 0.001);
        assert_eq!(map_gate_threshold(250.0), 1.0);
        assert_eq!(map_gate_threshold(f64::NAN), 0.001);
    }

    proptest! {
        #[test]
        fn gate_threshold_is_monotonic(a in 0u32..100, step in 1u32..=100) {
            let b = (a + step).min(100);
            prop_assume!(a < b);
            prop_assert!(map_gate_threshold(a as f64) < map_gate_threshold(b as f64));
        }

        #[test]
        fn gate_threshold_stays_in_range(pct in -1000.0f64..1000.0) {
            let value = map_gate_threshold(pct);
            prop_assert!((0.001..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_mic_chain_removed_when_effects_off() {
        let settings = MicFilterSettings::default();
        assert_eq!(render_mic_chain(&settings).body, None);

        let disabled = MicFilterSettings {
            noise_suppression: true,
            gate_enabled: true,
            fx_enabled: false,
            ..Default::default()
        };
        assert_eq!(render_mic_chain(&disabled).body, None);
    }

    #[test]
    fn test_mic_chain_is_mono_with_gate_threshold() {
        let settings = MicFilterSettings {
            gate_enabled: true,
            gate_threshold: 100.0,
            ..Default::default()
        };
        let chain = FilterChain::mic(&settings).unwrap();
        assert_eq!(chain.channels(), 1);
        assert_eq!(chain.control("rnnoise", "enabled"), Some(0.0));
        assert_eq!(chain.control("gate", "enabled"), Some(1.0));
        assert_eq!(chain.control("gate", "gt"), Some(1.0));

        let body = chain.render();
        assert!(body.contains("audio.position   = [ MONO ]"));
        assert!(body.contains("gt = 1\n"));
        assert!(body.contains("node.name    = \"mixrig_micfx\""));
        assert!(body.contains("target.object = \"@DEFAULT_SOURCE@\""));
    }

    #[test]
    fn test_suppressor_off_disables_rnnoise_node() {
        let settings = MicFilterSettings {
            noise_suppression: true,
            suppressor: NoiseSuppressor::Off,
            ..Default::default()
        };
        let chain = FilterChain::mic(&settings).unwrap();
        assert_eq!(chain.control("rnnoise", "enabled"), Some(0.0));
    }

    #[test]
    fn test_chat_chain_passthrough_uses_copy_nodes() {
        let chain = FilterChain::chat(&ChatFilterSettings::default());
        assert_eq!(chain.channels(), 2);
        assert!(chain.has_node("copyL"));
        assert!(chain.has_node("copyR"));
        assert!(!chain.has_node("gate"));
        let body = chain.render();
        assert!(body.contains("links = [ ]"));
        assert!(body.contains("outputs = [ \"copyL:Out\" \"copyR:Out\" ]"));
    }

    #[test]
    fn test_chat_gate_test_forces_gate_on() {
        let settings = ChatFilterSettings {
            noise_suppression: true,
            gate_test: true,
            gate_threshold: 0.0,
            ..Default::default()
        };
        let chain = FilterChain::chat(&settings);
        assert!(chain.has_node("rnnoise"));
        assert_eq!(chain.control("gate", "enabled"), Some(1.0));
        assert_eq!(chain.control("gate", "gt_l"), Some(0.001));
        assert_eq!(chain.control("gate", "gt_r"), Some(0.001));
        assert!(chain.render().contains("\"rnnoise:audio_out_2\" input = \"gate:in_r\""));
    }

    #[test]
    fn test_link_bootstrap_skips_mic_monitor_and_empty() {
        let mut links = BTreeMap::new();
        links.insert("browser.monitor".to_string(), "hw0".to_string());
        links.insert("mic.monitor".to_string(), "hw0".to_string());
        links.insert("game.monitor".to_string(), String::new());

        let body = render_link_bootstrap(&links, 20).body.unwrap();
        assert!(body.contains(
            "{ cmd = \"load-module\" args = \"module-loopback source=browser.monitor sink=hw0 latency_msec=20\" }"
        ));
        assert!(!body.contains("mic.monitor"));
        assert!(!body.contains("game.monitor"));
    }

    #[test]
    fn test_stream_output_descriptor() {
        let body = render_stream_output(Some("hw1"), 20).body.unwrap();
        assert!(body.contains("source=stream.monitor sink=hw1"));
        let empty = render_stream_output(None, 20).body.unwrap();
        assert!(!empty.contains("load-module"));
    }

    #[tokio::test]
    async fn test_commit_writes_and_removes() {
        let temp_dir = TempDir::new().unwrap();
        let store = DescriptorStore::new(
            temp_dir.path().join("pipewire.conf.d"),
            temp_dir.path().join("pipewire-pulse.conf.d"),
        );

        let on = MicFilterSettings {
            noise_suppression: true,
            ..Default::default()
        };
        store.commit(&render_mic_chain(&on)).await.unwrap();
        assert!(store.exists(DescriptorKind::MicChain));
        assert!(store
            .path_of(DescriptorKind::MicChain)
            .starts_with(temp_dir.path().join("pipewire.conf.d")));

        store
            .commit(&render_mic_chain(&MicFilterSettings::default()))
            .await
            .unwrap();
        assert!(!store.exists(DescriptorKind::MicChain));

        // Removing an absent file is fine
        store.remove(DescriptorKind::MicChain).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_if_absent_keeps_existing() {
        let temp_dir = TempDir::new().unwrap();
        let store = DescriptorStore::new(temp_dir.path().into(), temp_dir.path().into());
        assert!(store.commit_if_absent(&render_mic_sink()).await.unwrap());
        assert!(!store.commit_if_absent(&render_mic_sink()).await.unwrap());
        let body = fs::read_to_string(store.path_of(DescriptorKind::MicSink))
            .await
            .unwrap();
        assert!(body.contains("module-null-sink sink_name=mic"));
    }
}
