//! mixrigd: virtual audio mixing rig daemon and control CLI

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mixrig_core::domain::audio::StreamId;
use mixrig_core::domain::config::{ConfigManager, JsonFileStore};
use mixrig_core::domain::filter_chain::{ChatFilterSettings, MicFilterSettings};
use mixrig_core::domain::gateway::CommandGateway;
use mixrig_core::domain::inspector::ListMode;
use mixrig_core::domain::rig::RigService;
use mixrig_infra::{PactlControl, PwCatSpawner, TokioProcessRunner};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mixrigd")]
#[command(about = "Virtual audio mixing rig on top of PipeWire", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration directory (defaults to ~/.config/mixrig)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the rig, then run background tasks until interrupted
    Run {
        /// Don't print level snapshots on stdout
        #[arg(long)]
        quiet: bool,
        /// Don't watch the state file for external edits
        #[arg(long)]
        no_watch: bool,
    },
    /// Control tool health, monitors and current routing
    Status,
    /// Restart the audio backend and re-create every link
    RestartAudio,
    /// List output devices
    Sinks {
        /// Include the rig's own helper devices
        #[arg(long)]
        raw: bool,
        /// Only the channels an application can be routed to
        #[arg(long, conflicts_with = "raw")]
        route: bool,
    },
    /// List input devices
    Sources {
        #[arg(long)]
        raw: bool,
    },
    /// List application streams grouped by application
    Streams,
    /// Move client streams onto a sink
    Move {
        sink: String,
        #[arg(required = true)]
        ids: Vec<u32>,
    },
    /// Print level snapshots as JSON lines
    Levels {
        /// Stop after this many snapshots
        #[arg(long)]
        count: Option<usize>,
    },
    /// Route a source into a sink, replacing its previous link
    Link { source: String, sink: String },
    /// Set the system output and move the default channel links onto it
    DefaultSink { sink: String },
    /// Set the system input feeding the virtual microphone
    DefaultSource { source: String },
    /// Disconnect the physical input from the virtual microphone
    MicDisconnect,
    /// Per-application sink overrides
    Override {
        #[command(subcommand)]
        action: OverrideAction,
    },
    /// Apply microphone and chat filter settings
    Filters(FilterArgs),
    /// Sink volume in percent (0-150)
    Volume { sink: String, percent: f64 },
    /// Source volume in percent (0-150)
    SourceVolume { source: String, percent: f64 },
    /// Mute or unmute a sink
    Mute { sink: String, state: Toggle },
    /// Dry/wet mix of the chat filter in percent
    ChatMix { percent: f64 },
    /// Force the chat gate on to audition it, without saving the setting
    GateTest { state: Toggle },
    /// Feed the soundboard into the virtual microphone
    SoundboardMic { state: Toggle },
    /// Feed the chat into the virtual microphone
    ChatMic { state: Toggle },
    /// Mix a channel into the stream sink
    StreamLink { sink: String, state: Toggle },
    /// Play the stream mix on a sink; without a sink, stop playing it
    StreamOutput { sink: Option<String> },
    /// Allow or refuse remote control from the local network; without a
    /// state, print the current setting
    Lan { state: Option<Toggle> },
    /// Show the access PIN
    Pin {
        /// Generate a new PIN first
        #[arg(long, conflicts_with = "verify")]
        refresh: bool,
        /// Check a candidate PIN instead of printing it
        #[arg(long, value_name = "PIN")]
        verify: Option<String>,
    },
}

#[derive(Subcommand)]
enum OverrideAction {
    /// Pin an application (`app|binary` key) to a sink
    Set { key: String, sink: String },
    /// Let the application follow the default routing again
    Clear { key: String },
    /// Show every override
    List,
}

#[derive(Args)]
struct FilterArgs {
    /// Noise suppression on the microphone
    #[arg(long)]
    rnnoise: bool,
    /// Noise gate on the microphone
    #[arg(long)]
    gate: bool,
    /// Microphone gate threshold on the 0-100 scale
    #[arg(long, default_value_t = 45.0)]
    threshold: f64,
    /// Disable every microphone effect regardless of the flags above
    #[arg(long)]
    no_fx: bool,
    /// Noise suppression on the chat channel
    #[arg(long)]
    chat_rnnoise: bool,
    /// Noise gate on the chat channel
    #[arg(long)]
    chat_gate: bool,
    #[arg(long, default_value_t = 45.0)]
    chat_threshold: f64,
    /// Wet share of the chat mix in percent
    #[arg(long, default_value_t = 100.0)]
    chat_mix: f64,
    /// Write the filter chains but don't restart the engine
    #[arg(long)]
    defer: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout carries command output and the level feed
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_rig(config_dir: Option<PathBuf>) -> anyhow::Result<Arc<RigService>> {
    let config_dir = match config_dir {
        Some(dir) => dir,
        None => ConfigManager::default_config_dir()?,
    };
    let config = ConfigManager::new(config_dir).load().await;

    let runner = Arc::new(TokioProcessRunner::new());
    let gateway = Arc::new(CommandGateway::new(runner, config.gateway.clone()));
    let control = Arc::new(PactlControl::with_program(gateway, config.tools.pactl.clone()));
    let mut spawner = PwCatSpawner::new(config.tools.pw_cat.clone());
    if let Some(dir) = &config.tools.runtime_dir {
        spawner = spawner.with_runtime_dir(dir);
    }
    let store = Arc::new(JsonFileStore::new(config.state_path()));

    Ok(Arc::new(
        RigService::new(config, control, Arc::new(spawner), store).await,
    ))
}

async fn run_daemon(rig: Arc<RigService>, quiet: bool, no_watch: bool) -> anyhow::Result<()> {
    info!("mixrigd starting");
    rig.startup().await;
    let watch = (!no_watch).then(|| rig.config().state_path());
    rig.start_background(watch).await;
    if let Some(pin) = rig.pin().await {
        info!(pin, "Access PIN");
    }

    if quiet {
        tokio::signal::ctrl_c().await?;
    } else {
        let _observer = rig.observe();
        let mut levels = rig.subscribe_levels();
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                snapshot = levels.recv() => match snapshot {
                    Some(snapshot) => println!("{}", snapshot.to_json_line()),
                    // Dropped as a slow subscriber
                    None => levels = rig.subscribe_levels(),
                },
            }
        }
    }

    info!("Shutting down");
    rig.shutdown().await;
    Ok(())
}

async fn print_levels(rig: Arc<RigService>, count: Option<usize>) -> anyhow::Result<()> {
    let policy = rig.monitor().policy().clone();
    rig.monitor().refresh_targets(rig.inspector()).await;

    let mut feed = tokio::time::interval(policy.feed_interval);
    let mut retarget = tokio::time::interval(policy.retarget_interval);
    feed.set_missed_tick_behavior(MissedTickBehavior::Skip);
    retarget.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut printed = 0usize;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = retarget.tick() => rig.monitor().refresh_targets(rig.inspector()).await,
            _ = feed.tick() => {
                println!("{}", rig.levels().to_json_line());
                printed += 1;
                if count.is_some_and(|n| printed >= n) {
                    break;
                }
            }
        }
    }
    rig.shutdown().await;
    Ok(())
}

fn filter_settings(args: &FilterArgs) -> (MicFilterSettings, ChatFilterSettings) {
    let mic = MicFilterSettings {
        noise_suppression: args.rnnoise,
        gate_enabled: args.gate,
        gate_threshold: args.threshold,
        fx_enabled: !args.no_fx,
        ..MicFilterSettings::default()
    };
    let chat = ChatFilterSettings {
        noise_suppression: args.chat_rnnoise,
        gate_enabled: args.chat_gate,
        gate_threshold: args.chat_threshold,
        mix: args.chat_mix,
        ..ChatFilterSettings::default()
    };
    (mic, chat)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rig = build_rig(cli.config_dir)
        .await
        .context("Failed to initialise the rig")?;

    match cli.command {
        Command::Run { quiet, no_watch } => run_daemon(rig, quiet, no_watch).await?,
        Command::Status => print_json(&rig.status().await)?,
        Command::RestartAudio => {
            let outcome = rig.restart_audio().await;
            print_json(&outcome)?;
        }
        Command::Sinks { route: true, .. } => print_json(&rig.route_sinks().await)?,
        Command::Sinks { raw, .. } => {
            let mode = if raw { ListMode::Raw } else { ListMode::Presented };
            print_json(&rig.sinks(mode).await)?;
        }
        Command::Sources { raw } => {
            let mode = if raw { ListMode::Raw } else { ListMode::Presented };
            print_json(&rig.sources(mode).await)?;
        }
        Command::Streams => print_json(&rig.client_streams().await)?,
        Command::Move { sink, ids } => {
            let ids: Vec<StreamId> = ids.into_iter().map(StreamId).collect();
            if !rig.move_streams(&ids, &sink).await {
                bail!("Not every stream could be moved to {}", sink);
            }
        }
        Command::Levels { count } => print_levels(rig, count).await?,
        Command::Link { source, sink } => print_json(&rig.set_link(&source, &sink).await)?,
        Command::DefaultSink { sink } => {
            let report = rig.set_default_sink(&sink).await?;
            print_json(&report)?;
        }
        Command::DefaultSource { source } => {
            if !rig.set_default_source(&source).await {
                bail!("Failed to set default source {}", source);
            }
        }
        Command::MicDisconnect => rig.disconnect_mic_input().await,
        Command::Override { action } => match action {
            OverrideAction::Set { key, sink } => {
                if !rig.set_override(&key, &sink).await {
                    bail!("Override saved, but not every stream of {} could be moved", key);
                }
            }
            OverrideAction::Clear { key } => {
                if !rig.clear_override(&key).await {
                    println!("No override for {}", key);
                }
            }
            OverrideAction::List => print_json(&rig.state().await.overrides)?,
        },
        Command::Filters(args) => {
            let (mic, chat) = filter_settings(&args);
            let outcome = rig.apply_filter_settings(mic, chat, args.defer).await;
            print_json(&outcome)?;
        }
        Command::Volume { sink, percent } => {
            if !rig.set_sink_volume(&sink, percent).await {
                bail!("Failed to set volume of {}", sink);
            }
        }
        Command::SourceVolume { source, percent } => {
            if !rig.set_source_volume(&source, percent).await {
                bail!("Failed to set volume of {}", source);
            }
        }
        Command::Mute { sink, state } => {
            if !rig.set_sink_mute(&sink, state.enabled()).await {
                bail!("Failed to change mute of {}", sink);
            }
        }
        Command::ChatMix { percent } => {
            if !rig.set_chat_mix(percent).await {
                bail!("Chat mix not applied");
            }
        }
        Command::GateTest { state } => {
            print_json(&rig.audition_chat_gate(state.enabled()).await)?;
        }
        Command::SoundboardMic { state } => {
            if !rig.set_soundboard_mic(state.enabled()).await {
                bail!("Soundboard link into the mic could not be created");
            }
        }
        Command::ChatMic { state } => {
            if !rig.set_chat_mic(state.enabled()).await {
                bail!("Chat link into the mic could not be created");
            }
        }
        Command::StreamLink { sink, state } => {
            if !rig.set_stream_link(&sink, state.enabled()).await {
                bail!("Stream link for {} could not be created", sink);
            }
        }
        Command::StreamOutput { sink: Some(sink) } => {
            print_json(&rig.set_stream_output(Some(sink)).await)?;
        }
        Command::StreamOutput { sink: None } => {
            let removed = rig.clear_stream_output().await;
            println!("Removed {} stream output link(s)", removed);
        }
        Command::Lan { state: Some(state) } => rig.set_lan_enabled(state.enabled()).await,
        Command::Lan { state: None } => {
            let enabled = rig.lan_enabled().await;
            println!("{}", if enabled { "on" } else { "off" });
        }
        Command::Pin {
            verify: Some(candidate),
            ..
        } => {
            if !rig.verify_pin(&candidate).await {
                bail!("PIN does not match");
            }
            println!("PIN ok");
        }
        Command::Pin { refresh, .. } => {
            let pin = if refresh {
                Some(rig.rotate_pin().await)
            } else {
                rig.pin().await
            };
            match pin {
                Some(pin) => println!("{:04}", pin),
                None => println!("No PIN assigned yet; start the daemon or use --refresh"),
            }
        }
    }

    Ok(())
}
