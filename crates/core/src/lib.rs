//! Mixrig core: routing/reconciliation engine for a desktop audio rig
//!
//! The core owns all policy. Everything that touches the outside world sits
//! behind a trait ([`domain::ProcessRunner`], [`domain::AudioControl`],
//! [`domain::CaptureSpawner`], [`domain::ConfigStore`]) and is implemented in
//! `mixrig-infra`.

pub mod domain;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
