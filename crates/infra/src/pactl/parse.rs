//! Parsers for `pactl` text output
//!
//! Long listings (`pactl list sinks`) are blocks opened by a header such as
//! `Sink #47`, followed by tab-indented `Key: value` lines and a nested
//! `Properties:` section of `key = "value"` lines. Short listings are one
//! tab-separated record per line.

use mixrig_core::domain::audio::{ClientStream, DeviceEntry, ModuleEntry, ModuleId, StreamId};
use std::collections::HashMap;

/// Header of one block in a long listing
pub const SINK_HEADER: &str = "Sink #";
pub const SOURCE_HEADER: &str = "Source #";
pub const SINK_INPUT_HEADER: &str = "Sink Input #";

/// One `Header #N` block, split into fields and properties
#[derive(Debug, Default)]
struct Block<'a> {
    index: u32,
    fields: HashMap<&'a str, &'a str>,
    properties: HashMap<&'a str, &'a str>,
}

impl<'a> Block<'a> {
    fn field(&self, key: &str) -> &'a str {
        self.fields.get(key).copied().unwrap_or_default()
    }

    fn property(&self, key: &str) -> &'a str {
        self.properties.get(key).copied().unwrap_or_default()
    }
}

fn blocks<'a>(text: &'a str, header: &str) -> Vec<Block<'a>> {
    let mut out: Vec<Block<'a>> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = line.strip_prefix(header) {
            match rest.trim().parse() {
                Ok(index) => out.push(Block {
                    index,
                    ..Default::default()
                }),
                Err(_) => continue,
            }
            continue;
        }
        let Some(block) = out.last_mut() else {
            continue;
        };
        if let Some((key, value)) = trimmed.split_once(" = ") {
            block
                .properties
                .insert(key.trim(), value.trim().trim_matches('"'));
        } else if let Some((key, value)) = trimmed.split_once(':') {
            block.fields.entry(key.trim()).or_insert(value.trim());
        }
    }
    out
}

/// `n/a` and the engine's "no owner" sentinel both mean no module
fn owner_module(value: &str) -> Option<ModuleId> {
    value
        .parse::<u32>()
        .ok()
        .filter(|id| *id != u32::MAX)
        .map(ModuleId)
}

/// Devices from `pactl list sinks` or `pactl list sources`
pub fn parse_devices(text: &str, header: &str) -> Vec<DeviceEntry> {
    blocks(text, header)
        .into_iter()
        .filter_map(|block| {
            let name = block.field("Name");
            if name.is_empty() {
                return None;
            }
            let description = match block.field("Description") {
                "" => name,
                d => d,
            };
            let mut entry = DeviceEntry::new(block.index, name, description);
            entry.owner_module = owner_module(block.field("Owner Module"));
            entry.state = block.field("State").to_string();
            Some(entry)
        })
        .collect()
}

/// Client streams from `pactl list sink-inputs`. Sink indices are resolved to
/// names through `sinks`; unresolved indices are kept as text.
pub fn parse_sink_inputs(text: &str, sinks: &HashMap<u32, String>) -> Vec<ClientStream> {
    blocks(text, SINK_INPUT_HEADER)
        .into_iter()
        .map(|block| {
            let sink_field = block.field("Sink");
            let sink = sink_field
                .parse::<u32>()
                .ok()
                .and_then(|index| sinks.get(&index).cloned())
                .unwrap_or_else(|| sink_field.to_string());
            let state = match (block.field("State"), block.field("Corked")) {
                ("", "yes") => "CORKED".to_string(),
                ("", _) => "RUNNING".to_string(),
                (state, _) => state.to_string(),
            };
            ClientStream {
                id: StreamId(block.index),
                sink,
                owner_module: owner_module(block.field("Owner Module")),
                state,
                app: block.property("application.name").to_string(),
                binary: block.property("application.process.binary").to_string(),
                media: block.property("media.name").to_string(),
                node_name: block.property("node.name").to_string(),
                object_id: block.property("object.id").parse().ok(),
            }
        })
        .collect()
}

/// `index -> name` from a short listing such as `pactl list short sinks`
pub fn parse_short_index_map(text: &str) -> HashMap<u32, String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let index = cols.next()?.trim().parse().ok()?;
            let name = cols.next()?.trim();
            (!name.is_empty()).then(|| (index, name.to_string()))
        })
        .collect()
}

/// Loaded modules from `pactl list short modules`
pub fn parse_short_modules(text: &str) -> Vec<ModuleEntry> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.splitn(3, '\t');
            let id = cols.next()?.trim().parse().ok()?;
            let name = cols.next()?.trim().to_string();
            let args = cols.next().unwrap_or_default().trim().to_string();
            Some(ModuleEntry {
                id: ModuleId(id),
                name,
                args,
            })
        })
        .collect()
}

/// Module index printed by `pactl load-module`
pub fn parse_module_id(stdout: &str) -> Option<ModuleId> {
    stdout.lines().next()?.trim().parse().ok().map(ModuleId)
}
