//! Graph inspector: structured, normalized views of the live audio graph
//!
//! Two query modes exist over the same listing. [`ListMode::Presented`] hides
//! the rig's own helper devices and is what policy and UI layers see;
//! [`ListMode::Raw`] hides nothing and is what drift detection uses.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::domain::audio::{AudioControl, Channel, ClientStream, LinkRecord, StreamId};
use crate::domain::registry::{ResourcePurpose, ResourceRegistry};

/// Which view of a listing to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Own helper devices filtered out
    Presented,
    /// Everything the engine reports
    Raw,
}

/// A sink or source with its human label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceView {
    pub name: String,
    pub description: String,
}

/// All live streams of one application, moved as a unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStreamGroup {
    pub key: String,
    pub app: String,
    pub binary: String,
    pub display: String,
    pub ids: Vec<StreamId>,
    /// Sink of the first stream
    pub sink: String,
    /// Sink of each stream, parallel to `ids`
    pub sinks: Vec<String>,
    pub state: String,
}

impl ClientStreamGroup {
    /// Streams of the group not currently playing into `sink`
    pub fn ids_off(&self, sink: &str) -> Vec<StreamId> {
        self.ids
            .iter()
            .zip(&self.sinks)
            .filter(|(_, s)| s.as_str() != sink)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// How the daemon recognises its own client streams
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfIdentity {
    /// Case-insensitive substrings of `application.name`
    pub app_names: Vec<String>,
    /// Exact `application.process.binary` values
    pub binaries: Vec<String>,
}

impl Default for SelfIdentity {
    fn default() -> Self {
        Self {
            app_names: vec!["mixrig".to_string()],
            binaries: vec!["mixrigd".to_string()],
        }
    }
}

impl SelfIdentity {
    pub fn matches(&self, stream: &ClientStream) -> bool {
        let app = stream.app.to_lowercase();
        self.app_names.iter().any(|n| app.contains(&n.to_lowercase()))
            || self.binaries.iter().any(|b| *b == stream.binary)
    }
}

struct HardwareAlias {
    pattern: &'static str,
    label: &'static str,
    variants: &'static [(&'static str, &'static str)],
}

const HARDWARE_ALIASES: &[HardwareAlias] = &[HardwareAlias {
    pattern: "umc202hd",
    label: "UMC202HD 192k",
    variants: &[("mic1", "Input 1"), ("mic2", "Input 2"), ("line", "Line A")],
}];

/// Rewrite raw engine labels into stable human-friendly names
pub fn normalize_device_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return raw.to_string();
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("mixrig mic fx") || lower.contains("mixrig_micfx") {
        return "Mixrig Mic FX".to_string();
    }
    for alias in HARDWARE_ALIASES {
        if !lower.contains(alias.pattern) {
            continue;
        }
        if let Some((_, variant)) = alias.variants.iter().find(|(key, _)| lower.contains(key)) {
            return format!("{} {}", alias.label, variant);
        }
    }
    trimmed.to_string()
}

/// Read-only queries over the live graph
pub struct GraphInspector {
    control: Arc<dyn AudioControl>,
    registry: Arc<ResourceRegistry>,
    identity: SelfIdentity,
}

impl GraphInspector {
    pub fn new(
        control: Arc<dyn AudioControl>,
        registry: Arc<ResourceRegistry>,
        identity: SelfIdentity,
    ) -> Self {
        Self {
            control,
            registry,
            identity,
        }
    }

    fn hidden_in_presented(&self, name: &str) -> bool {
        match self.registry.device_purpose(name) {
            // The virtual mic sources are what applications record from
            Some(ResourcePurpose::MicSource) | Some(ResourcePurpose::MicFxSource) => false,
            Some(_) => true,
            None => false,
        }
    }

    pub async fn list_sinks(&self, mode: ListMode) -> Vec<DeviceView> {
        self.control
            .sinks()
            .await
            .into_iter()
            .filter(|s| !s.name.is_empty())
            .filter(|s| mode == ListMode::Raw || !self.hidden_in_presented(&s.name))
            .map(|s| DeviceView {
                description: normalize_device_label(if s.description.is_empty() {
                    &s.name
                } else {
                    &s.description
                }),
                name: s.name,
            })
            .collect()
    }

    /// The channel sinks a client stream can be assigned to
    pub async fn list_route_sinks(&self) -> Vec<DeviceView> {
        self.list_sinks(ListMode::Raw)
            .await
            .into_iter()
            .filter(|s| {
                matches!(
                    self.registry.device_purpose(&s.name),
                    Some(ResourcePurpose::ChannelSink(c)) if Channel::ROUTABLE.contains(&c)
                )
            })
            .collect()
    }

    pub async fn list_sources(&self, mode: ListMode) -> Vec<DeviceView> {
        self.control
            .sources()
            .await
            .into_iter()
            .filter(|s| !s.name.is_empty())
            .filter(|s| {
                mode == ListMode::Raw
                    || (!s.is_monitor() && !self.hidden_in_presented(&s.name))
            })
            .map(|s| DeviceView {
                description: normalize_device_label(if s.description.is_empty() {
                    &s.name
                } else {
                    &s.description
                }),
                name: s.name,
            })
            .collect()
    }

    /// Names of every live source, including monitors
    pub async fn live_source_names(&self) -> HashSet<String> {
        self.control
            .sources()
            .await
            .into_iter()
            .map(|s| s.name)
            .filter(|n| !n.is_empty())
            .collect()
    }

    pub async fn live_sink_names(&self) -> HashSet<String> {
        self.control
            .sinks()
            .await
            .into_iter()
            .map(|s| s.name)
            .filter(|n| !n.is_empty())
            .collect()
    }

    fn is_own_stream(&self, stream: &ClientStream) -> bool {
        self.identity.matches(stream)
            || stream
                .owner_module
                .map(|m| self.registry.owns_module(m))
                .unwrap_or(false)
    }

    /// Every client stream as reported, without grouping or filtering
    pub async fn raw_client_streams(&self) -> Vec<ClientStream> {
        self.control.client_streams().await
    }

    /// Application streams grouped by (application, binary), excluding
    /// loopbacks and the daemon's own streams
    pub async fn list_client_streams(&self) -> Vec<ClientStreamGroup> {
        let streams = self.control.client_streams().await;
        let groups = group_client_streams(
            streams
                .into_iter()
                .filter(|s| !s.app.is_empty() && !s.is_loopback() && !self.is_own_stream(s)),
        );
        debug!(count = groups.len(), "Listed client stream groups");
        groups
    }

    /// Loaded loopback links matching `predicate`
    pub async fn list_loaded_links<P>(&self, predicate: P) -> Vec<LinkRecord>
    where
        P: Fn(&LinkRecord) -> bool,
    {
        self.control
            .modules()
            .await
            .iter()
            .filter_map(LinkRecord::from_module)
            .filter(|link| predicate(link))
            .collect()
    }
}

#[derive(Default)]
struct GroupBuilder {
    app: String,
    binary: String,
    ids: Vec<StreamId>,
    sinks: Vec<String>,
    states: BTreeSet<String>,
    media: Vec<String>,
}

/// Group streams sharing (application, binary), preserving first-seen order
pub fn group_client_streams(streams: impl IntoIterator<Item = ClientStream>) -> Vec<ClientStreamGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, GroupBuilder> = HashMap::new();

    for stream in streams {
        let key = stream.group_key();
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            GroupBuilder {
                app: stream.app.clone(),
                binary: stream.binary.clone(),
                ..Default::default()
            }
        });
        entry.ids.push(stream.id);
        entry.sinks.push(stream.sink.clone());
        if !stream.state.is_empty() {
            entry.states.insert(stream.state.clone());
        }
        if !stream.media.is_empty() && !entry.media.contains(&stream.media) {
            entry.media.push(stream.media);
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let group = groups.remove(&key)?;
            let media = group.media.iter().take(2).cloned().collect::<Vec<_>>().join(", ");
            let display = if media.is_empty() {
                group.app.clone()
            } else {
                format!("{} - {}", group.app, media)
            };
            Some(ClientStreamGroup {
                key,
                display,
                state: group.states.into_iter().collect::<Vec<_>>().join("/"),
                app: group.app,
                binary: group.binary,
                sink: group.sinks.first().cloned().unwrap_or_default(),
                ids: group.ids,
                sinks: group.sinks,
            })
        })
        .collect()
}
