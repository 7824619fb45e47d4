//! Command gateway: the single door to external processes
//!
//! Every call to the audio control tool goes through [`CommandGateway::execute`].
//! A failing call opens a circuit for a cooldown during which further calls
//! return immediately without spawning anything. Backend restarts are gated by
//! their own, longer cooldown.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::audio::{GatewayStatus, RestartOutcome};

/// Captured result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program with an argument list. No shell is involved.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<ProcessOutput>;
}

/// What the gateway returns to callers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub ok: bool,
}

impl CommandOutput {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Timing and classification policy for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayPolicy {
    /// Program name of the gated tool (matched on file name)
    pub gated_tool: String,
    /// Program used for backend restarts
    pub restart_tool: String,
    #[serde(with = "crate::domain::config::millis")]
    pub failure_cooldown: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub log_suppression: Duration,
    #[serde(with = "crate::domain::config::millis")]
    pub restart_cooldown: Duration,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            gated_tool: "pactl".to_string(),
            restart_tool: "/usr/bin/systemctl".to_string(),
            failure_cooldown: Duration::from_secs(5),
            log_suppression: Duration::from_secs(30),
            restart_cooldown: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    disabled_until: Option<Instant>,
    last_error: String,
    last_error_at: Option<Instant>,
}

/// Serializes access to the external tools and applies circuit breaking
pub struct CommandGateway {
    runner: Arc<dyn ProcessRunner>,
    policy: GatewayPolicy,
    circuit: Mutex<CircuitState>,
    last_restart: Mutex<Option<Instant>>,
    // Held for the whole of a gated invocation
    serial: tokio::sync::Mutex<()>,
}

impl CommandGateway {
    pub fn new(runner: Arc<dyn ProcessRunner>, policy: GatewayPolicy) -> Self {
        Self {
            runner,
            policy,
            circuit: Mutex::new(CircuitState::default()),
            last_restart: Mutex::new(None),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    /// Whether calls to `tool` are subject to the circuit breaker
    pub fn is_gated(&self, tool: &str) -> bool {
        let name = Path::new(tool)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(tool);
        name == self.policy.gated_tool
    }

    /// Whether the circuit is currently closed
    pub fn is_available(&self) -> bool {
        self.retry_in().is_zero()
    }

    fn retry_in(&self) -> Duration {
        let circuit = self.circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit
            .disabled_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Run `tool` with `args`. Gated calls run one at a time; those made
    /// while the circuit is open return a failed, empty output without
    /// spawning a process.
    pub async fn execute(&self, tool: &str, args: &[String]) -> CommandOutput {
        if !self.is_gated(tool) {
            return self.invoke(tool, args, false).await;
        }
        if !self.is_available() {
            debug!(tool, ?args, "Circuit open, skipping call");
            return CommandOutput::skipped();
        }
        let _serial = self.serial.lock().await;
        // The call queued ahead of us may have opened the circuit
        if !self.is_available() {
            debug!(tool, ?args, "Circuit opened while queued, skipping call");
            return CommandOutput::skipped();
        }
        self.invoke(tool, args, true).await
    }

    async fn invoke(&self, tool: &str, args: &[String], gated: bool) -> CommandOutput {
        match self.runner.run(tool, args).await {
            Ok(output) if output.success => CommandOutput {
                stdout: output.stdout.trim().to_string(),
                ok: true,
            },
            Ok(output) => {
                if gated {
                    let message = if output.stderr.trim().is_empty() {
                        format!("exit {}", output.code.unwrap_or(-1))
                    } else {
                        output.stderr.trim().to_string()
                    };
                    self.record_failure(tool, &message);
                }
                CommandOutput {
                    stdout: output.stdout.trim().to_string(),
                    ok: false,
                }
            }
            Err(e) => {
                if gated {
                    self.record_failure(tool, &e.to_string());
                } else {
                    warn!(tool, error = %e, "Failed to run command");
                }
                CommandOutput::skipped()
            }
        }
    }

    /// Open the circuit. Returns `true` when the failure was logged.
    fn record_failure(&self, tool: &str, message: &str) -> bool {
        let now = Instant::now();
        let mut circuit = self.circuit.lock().unwrap_or_else(|e| e.into_inner());

        let quiet_for = circuit
            .last_error_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        let logged = message != circuit.last_error || quiet_for >= self.policy.log_suppression;
        if logged {
            warn!(tool, error = message, "Audio control tool failed");
            circuit.last_error = message.to_string();
            circuit.last_error_at = Some(now);
        }

        let until = now + self.policy.failure_cooldown;
        circuit.disabled_until = Some(match circuit.disabled_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        logged
    }

    /// Restart backend service units unless a restart happened within the
    /// restart cooldown, in which case the caller is told when to retry.
    pub async fn restart(&self, units: &[&str]) -> RestartOutcome {
        let now = Instant::now();
        {
            let mut last = self.last_restart.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                let elapsed = now.saturating_duration_since(at);
                if elapsed < self.policy.restart_cooldown {
                    let retry_in = self.policy.restart_cooldown - elapsed;
                    debug!(?units, ?retry_in, "Restart rejected, cooldown active");
                    return RestartOutcome::NotYet {
                        retry_in_secs: ceil_secs(retry_in),
                    };
                }
            }
            *last = Some(now);
        }

        info!(?units, "Restarting audio backend");
        let mut args = vec!["--user".to_string(), "restart".to_string()];
        args.extend(units.iter().map(|u| u.to_string()));
        let output = self.execute(&self.policy.restart_tool, &args).await;
        if !output.ok {
            warn!(?units, "Backend restart command reported failure");
        }
        RestartOutcome::Restarted
    }

    /// Snapshot for observers
    pub fn status(&self) -> GatewayStatus {
        let retry_in = self.retry_in();
        let last_error = self
            .circuit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone();
        GatewayStatus {
            available: retry_in.is_zero(),
            last_error,
            retry_in_secs: ceil_secs(retry_in),
            restart_cooldown_secs: ceil_secs(self.policy.restart_cooldown),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let millis = d.as_millis() as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gateway(runner: &Arc<ScriptedRunner>) -> CommandGateway {
        CommandGateway::new(runner.clone(), GatewayPolicy::default())
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_trimmed_stdout() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ProcessOutput::ok("hw0\n"));
        let gw = gateway(&runner);

        let out = gw.execute("/usr/bin/pactl", &args(&["get-default-sink"])).await;
        assert!(out.ok);
        assert_eq!(out.stdout, "hw0");
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_opens_circuit() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ProcessOutput::failed(1, "Connection refused"));
        let gw = gateway(&runner);

        let out = gw.execute("pactl", &args(&["list", "short", "sinks"])).await;
        assert!(!out.ok);
        assert!(!gw.is_available());

        // Within the cooldown nothing is spawned
        for _ in 0..5 {
            let out = gw.execute("pactl", &args(&["list", "short", "sinks"])).await;
            assert!(!out.ok);
            assert!(out.stdout.is_empty());
        }
        assert_eq!(runner.call_count(), 1);

        let status = gw.status();
        assert!(!status.available);
        assert_eq!(status.last_error, "Connection refused");
        assert_eq!(status.retry_in_secs, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closes_after_cooldown() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ProcessOutput::failed(1, "boom"));
        let gw = gateway(&runner);

        gw.execute("pactl", &args(&["info"])).await;
        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(!gw.execute("pactl", &args(&["info"])).await.ok);
        assert_eq!(runner.call_count(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        runner.push(ProcessOutput::ok("fine"));
        let out = gw.execute("pactl", &args(&["info"])).await;
        assert!(out.ok);
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_error_opens_circuit() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_spawn_error("No such file or directory");
        let gw = gateway(&runner);

        assert!(!gw.execute("pactl", &args(&["info"])).await.ok);
        assert!(!gw.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ungated_tools_bypass_circuit() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(ProcessOutput::failed(1, "boom"));
        let gw = gateway(&runner);
        gw.execute("pactl", &args(&["info"])).await;
        assert!(!gw.is_available());

        runner.push(ProcessOutput::failed(3, "other failure"));
        let out = gw.execute("/usr/bin/pw-cat", &args(&["--version"])).await;
        assert!(!out.ok);
        assert_eq!(runner.call_count(), 2);

        // An ungated failure does not extend the circuit
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(gw.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cooldown() {
        let runner = Arc::new(ScriptedRunner::new());
        let gw = gateway(&runner);

        assert_eq!(gw.restart(&["pipewire-pulse"]).await, RestartOutcome::Restarted);
        let call = runner.calls().pop().unwrap();
        assert_eq!(call.0, "/usr/bin/systemctl");
        assert_eq!(call.1, args(&["--user", "restart", "pipewire-pulse"]));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            gw.restart(&["pipewire-pulse"]).await,
            RestartOutcome::NotYet { retry_in_secs: 5 }
        );
        assert_eq!(runner.call_count(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(gw.restart(&["pipewire", "pipewire-pulse"]).await.restarted());
        assert_eq!(runner.call_count(), 2);
    }

    /// Sleeps on every call and records the highest overlap seen
    struct SlowRunner {
        delay: Duration,
        fail: bool,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowRunner {
        fn new(fail: bool) -> Self {
            Self {
                delay: Duration::from_millis(50),
                fail,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for SlowRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> std::io::Result<ProcessOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(if self.fail {
                ProcessOutput::failed(1, "Connection refused")
            } else {
                ProcessOutput::ok("ok")
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_calls_run_one_at_a_time() {
        let runner = Arc::new(SlowRunner::new(false));
        let gw = CommandGateway::new(runner.clone(), GatewayPolicy::default());
        let info = args(&["info"]);

        let (a, b, c, d) = tokio::join!(
            gw.execute("pactl", &info),
            gw.execute("pactl", &info),
            gw.execute("pactl", &info),
            gw.execute("pactl", &info),
        );
        assert!(a.ok && b.ok && c.ok && d.ok);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_calls_skip_once_circuit_opens() {
        let runner = Arc::new(SlowRunner::new(true));
        let gw = CommandGateway::new(runner.clone(), GatewayPolicy::default());
        let info = args(&["info"]);

        let (a, b, c) = tokio::join!(
            gw.execute("pactl", &info),
            gw.execute("pactl", &info),
            gw.execute("pactl", &info),
        );
        assert!(!a.ok && !b.ok && !c.ok);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_logging_is_throttled() {
        let runner = Arc::new(ScriptedRunner::new());
        let gw = gateway(&runner);

        assert!(gw.record_failure("pactl", "Connection refused"));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!gw.record_failure("pactl", "Connection refused"));
        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(!gw.record_failure("pactl", "Connection refused"));

        // A different message is logged right away
        assert!(gw.record_failure("pactl", "Access denied"));
        assert_eq!(gw.status().last_error, "Access denied");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(gw.record_failure("pactl", "Access denied"));
    }

    #[test]
    fn test_gated_tool_classification() {
        let runner = Arc::new(ScriptedRunner::new());
        let gw = gateway(&runner);
        assert!(gw.is_gated("pactl"));
        assert!(gw.is_gated("/usr/bin/pactl"));
        assert!(!gw.is_gated("/usr/bin/pw-cat"));
        assert!(!gw.is_gated("systemctl"));
    }
}
