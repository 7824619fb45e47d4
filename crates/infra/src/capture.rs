//! Level-meter captures recorded with `pw-cat`

use mixrig_core::domain::audio::{AudioError, Result};
use mixrig_core::domain::monitor::{CaptureControl, CaptureFormat, CaptureProcess, CaptureSpawner};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Spawns one `pw-cat --record` per capture target, writing raw PCM to stdout
#[derive(Debug, Clone)]
pub struct PwCatSpawner {
    program: String,
    runtime_dir: Option<PathBuf>,
}

impl Default for PwCatSpawner {
    fn default() -> Self {
        Self::new("pw-cat")
    }
}

impl PwCatSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            runtime_dir: None,
        }
    }

    /// Point captures at a specific user runtime directory. Needed when the
    /// daemon runs outside the desktop session that owns the audio server.
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn args(target: &str, format: &CaptureFormat) -> Vec<String> {
        vec![
            "--record".to_string(),
            "--format".to_string(),
            format.sample_format.clone(),
            "--rate".to_string(),
            format.rate.to_string(),
            "--channels".to_string(),
            format.channels.to_string(),
            "--target".to_string(),
            target.to_string(),
            "-".to_string(),
        ]
    }
}

struct ChildControl {
    child: Child,
}

impl CaptureControl for ChildControl {
    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Capture already exited");
        }
    }
}

impl CaptureSpawner for PwCatSpawner {
    fn spawn(&self, target: &str, format: &CaptureFormat) -> Result<CaptureProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(Self::args(target, format))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.runtime_dir {
            command
                .env("XDG_RUNTIME_DIR", dir)
                .env("PIPEWIRE_RUNTIME_DIR", dir)
                .env("PULSE_RUNTIME_PATH", dir.join("pulse"));
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(program = %self.program, target, error = %e, "Failed to start capture");
            AudioError::SpawnFailed {
                program: self.program.clone(),
                message: e.to_string(),
            }
        })?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| AudioError::CaptureError("capture has no stdout".to_string()))?;

        debug!(target, pid = ?child.id(), "Capture started");
        Ok(CaptureProcess {
            output: Box::new(output),
            control: Box::new(ChildControl { child }),
        })
    }
}
