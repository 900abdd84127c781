use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use paircall_core::broadcast::{CALL_CHANNEL, CrossTabCoordinator};
use paircall_core::config::Config;
use paircall_core::media::StaticMediaSource;
use paircall_core::session::{ControllerConfig, SessionController, UiEvent, UserCommand};
use paircall_core::signaling::WebSocketSignaling;
use paircall_core::storage::{FsStore, KeyValueStore, MemoryStore};
use paircall_core::telemetry::logging::{self, LogConfig, LogLevel};
use paircall_core::transport::webrtc::{IceSettings, RelayCredentials, WebRtcTransportFactory};

#[derive(Parser, Debug)]
#[command(name = "paircall", about = "Anonymous one-to-one call client", version)]
struct Cli {
    /// Display name shown to matched partners
    #[arg(long, env = "PAIRCALL_USERNAME")]
    username: Option<String>,

    /// Relay server (host:port or ws[s]:// url); overrides PAIRCALL_RELAY_SERVER
    #[arg(long)]
    relay: Option<String>,

    /// Comma-separated TURN relay urls, persisted for later runs
    #[arg(long)]
    turn: Option<String>,

    #[arg(long, requires = "turn")]
    turn_user: Option<String>,

    #[arg(long, requires = "turn")]
    turn_pass: Option<String>,

    /// Re-enter the queue automatically when the peer ends the call
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    keep_matching: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let store: Box<dyn KeyValueStore> = match FsStore::open() {
        Ok(store) => Box::new(store),
        Err(err) => {
            tracing::warn!(target = "main", error = %err, "settings store unavailable, credentials will not persist");
            Box::new(MemoryStore::new())
        }
    };
    let launch_relay = cli
        .turn
        .as_deref()
        .and_then(|urls| RelayCredentials::parse(urls, cli.turn_user.as_deref(), cli.turn_pass.as_deref()));
    let ice = IceSettings::resolve(launch_relay, store.as_ref());
    let has_relay_fallback = ice.has_relay_fallback();

    let relay_server = cli
        .relay
        .clone()
        .unwrap_or_else(|| Config::from_env().relay_server);
    let signaling = WebSocketSignaling::connect(&relay_server)
        .await
        .with_context(|| format!("failed to reach relay at {relay_server}"))?;
    tracing::info!(target = "main", relay = %relay_server, "connected to relay");

    let (controller, handle, mut ui_rx) = SessionController::new(
        ControllerConfig {
            username: cli.username.clone(),
            auto_requeue: cli.keep_matching,
            has_relay_fallback,
            ..ControllerConfig::default()
        },
        signaling,
        Arc::new(WebRtcTransportFactory::new(ice)),
        Arc::new(StaticMediaSource::new(true)),
        CrossTabCoordinator::join(CALL_CHANNEL),
    );

    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            render(event);
        }
    });

    let commands = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("commands: join, stop, hangup, mute, camera, rate <1-5>, skip, quit");
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("join") | Some("start") => commands.command(UserCommand::JoinQueue),
                Some("stop") => commands.command(UserCommand::StopMatching),
                Some("hangup") | Some("end") => commands.command(UserCommand::Hangup),
                Some("mute") => commands.command(UserCommand::ToggleMicrophone),
                Some("camera") => commands.command(UserCommand::ToggleCamera),
                Some("rate") => match parts.next().and_then(|n| n.parse::<u8>().ok()) {
                    Some(rating) => commands.command(UserCommand::SubmitRating(rating)),
                    None => println!("usage: rate <1-5>"),
                },
                Some("skip") => commands.command(UserCommand::SkipRating),
                Some("quit") | Some("exit") => {
                    commands.command(UserCommand::LeavePage);
                    break;
                }
                Some(other) => println!("unknown command: {other}"),
                None => {}
            }
        }
    });

    controller.run().await;
    Ok(())
}

fn render(event: UiEvent) {
    match event {
        UiEvent::Registered { user_id } => println!("registered as {user_id}"),
        UiEvent::Queued { queue_size } => match queue_size {
            Some(size) => println!("waiting for a match ({size} in queue)"),
            None => println!("waiting for a match"),
        },
        UiEvent::QueueUpdated { queue_size } => {
            if let Some(size) = queue_size {
                println!("queue update: {size} waiting");
            }
        }
        UiEvent::Dequeued => println!("left the queue"),
        UiEvent::MatchmakingActive(_) => {}
        UiEvent::Matched { room_id } => println!("matched (room {room_id})"),
        UiEvent::RemoteWaiting(true) => println!("waiting for peer media..."),
        UiEvent::RemoteWaiting(false) => {}
        UiEvent::CallLive => println!("call is live"),
        UiEvent::CallEnded { reason } => println!("call ended: {reason}"),
        UiEvent::MediaFailed { message } => println!("media error: {message}"),
        UiEvent::MicrophoneEnabled(enabled) => {
            println!("microphone {}", if enabled { "on" } else { "muted" })
        }
        UiEvent::CameraEnabled(enabled) => {
            println!("camera {}", if enabled { "on" } else { "off" })
        }
        UiEvent::RelayFallbackHint => {
            println!("still connecting; if this persists, configure a TURN relay with --turn")
        }
        UiEvent::FeedbackRequested { partner } => {
            println!("rate your call with {partner}: rate <1-5> or skip")
        }
    }
}
