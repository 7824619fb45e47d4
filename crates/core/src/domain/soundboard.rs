//! Bounded queue of soundboard trigger events
//!
//! Producers (remote triggers) enqueue without blocking; an observer drains
//! everything queued so far in one poll. Past capacity the oldest events are
//! dropped.

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundboardEventKind {
    Play,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundboardEvent {
    #[serde(rename = "type")]
    pub kind: SoundboardEventKind,
    pub slot_index: Option<u32>,
    pub category_index: Option<u32>,
    /// Milliseconds since the Unix epoch
    pub ts: u64,
}

impl SoundboardEvent {
    pub fn new(kind: SoundboardEventKind, slot_index: Option<u32>, category_index: Option<u32>) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind,
            slot_index,
            category_index,
            ts,
        }
    }
}

pub struct SoundboardQueue {
    events: ArrayQueue<SoundboardEvent>,
}

impl Default for SoundboardQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SoundboardQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Returns `true` when an older event had to be dropped
    pub fn enqueue(&self, event: SoundboardEvent) -> bool {
        self.events.force_push(event).is_some()
    }

    pub fn play(&self, slot_index: Option<u32>, category_index: Option<u32>) -> bool {
        self.enqueue(SoundboardEvent::new(
            SoundboardEventKind::Play,
            slot_index,
            category_index,
        ))
    }

    pub fn stop(&self, slot_index: Option<u32>) -> bool {
        self.enqueue(SoundboardEvent::new(SoundboardEventKind::Stop, slot_index, None))
    }

    /// Everything queued so far, oldest first
    pub fn drain(&self) -> Vec<SoundboardEvent> {
        let mut drained = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            drained.push(event);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }
}
