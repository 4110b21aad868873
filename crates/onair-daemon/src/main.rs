mod catalog;
mod core;
mod http;
mod mpv;
mod player;
mod presence;
mod socket;

use onair_proto::config::Config;
use onair_proto::protocol::Command;
use onair_proto::store::Store;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// In-stream metadata changed the displayed artist/title.
    Metadata { artist: String, title: String },
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Controllers only see problems
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = onair_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,onair_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Err(e) = std::fs::write(&config.daemon.pid_file, std::process::id().to_string()) {
        warn!("Could not write pid file {}: {}", config.daemon.pid_file.display(), e);
    }

    let store = Arc::new(Store::open_with_writer(&config.daemon.store_file));

    // Event channel — all external inputs funnel into SessionCore
    let (event_tx, event_rx) = mpsc::channel::<core::DaemonEvent>(256);

    let (player_tx, mut player_rx) = mpsc::channel::<player::PlayerEvent>(64);
    let player = mpv::MpvPlayer::connect(
        config.player.mpv_binary.clone(),
        config.player.default_volume,
        player_tx,
    )
    .await?;
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = player_rx.recv().await {
            if forward_tx.send(core::DaemonEvent::Player(event)).await.is_err() {
                break;
            }
        }
    });

    let session = core::SessionCore::new(
        player,
        store,
        &config,
        Box::new(presence::LogPresence),
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .await;
    let state_manager = session.state_manager();

    let clients = Arc::new(tokio::sync::RwLock::new(Vec::<socket::ClientHandle>::new()));

    let _socket_handle = socket::start_server(
        config.control.bind_address.clone(),
        config.control.port,
        state_manager.clone(),
        clients,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.control.bind_address.clone(),
            config.http.port,
            state_manager,
            event_tx.clone(),
        );
    }

    if config.catalog.refresh_on_start {
        let _ = event_tx
            .send(core::DaemonEvent::ClientCommand(Command::RefreshCatalog, None))
            .await;
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    session.run(event_rx).await?;

    let _ = std::fs::remove_file(&config.daemon.pid_file);
    info!("Daemon stopped");
    Ok(())
}
