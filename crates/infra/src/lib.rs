//! Adapters between the rig core and the host audio system
//!
//! - [`process`]: subprocess execution behind the command gateway
//! - [`pactl`]: the audio control surface, driven through `pactl`
//! - [`capture`]: level-meter captures recorded with `pw-cat`

pub mod capture;
pub mod pactl;
pub mod process;

pub use capture::PwCatSpawner;
pub use pactl::PactlControl;
pub use process::TokioProcessRunner;
