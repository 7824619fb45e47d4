//! Cross-crate integration tests
//!
//! The rig service is driven end to end through the fake audio graph, the
//! real `pactl` adapter over scripted process output, and real state files.

#[cfg(test)]
mod common;
#[cfg(test)]
mod gateway_integration;
#[cfg(test)]
mod routing_integration;
#[cfg(test)]
mod state_integration;
