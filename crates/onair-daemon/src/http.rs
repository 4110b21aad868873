//! HTTP mirror of the control protocol for scripts and browsers.

use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use onair_proto::protocol::{Command, CommandFailure, CommandReply, SessionState};
use onair_proto::state::StateManager;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/start/:media_id", post(start))
        .route("/api/toggle", post(toggle))
        .route("/api/stop", post(stop))
        .route("/api/next", post(next))
        .route("/api/prev", post(prev))
        .route("/api/resume", get(resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP API {}: {}", addr, e);
                return;
            }
        };
        info!("HTTP API listening on http://{}", addr);

        let app = create_router(AppState {
            state_manager,
            event_tx,
        });
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP API stopped: {}", e);
        }
    })
}

async fn get_state(State(app): State<AppState>) -> Json<SessionState> {
    Json(app.state_manager.get_state().await)
}

async fn start(State(app): State<AppState>, Path(media_id): Path<String>) -> impl IntoResponse {
    dispatch(
        &app,
        Command::StartPlayback {
            media_id,
            auto_play: true,
        },
    )
    .await
}

async fn toggle(State(app): State<AppState>) -> impl IntoResponse {
    dispatch(&app, Command::TogglePlayback).await
}

async fn stop(State(app): State<AppState>) -> impl IntoResponse {
    dispatch(&app, Command::StopPlayback).await
}

async fn next(State(app): State<AppState>) -> impl IntoResponse {
    dispatch(&app, Command::SkipNext { auto_play: None }).await
}

async fn prev(State(app): State<AppState>) -> impl IntoResponse {
    dispatch(&app, Command::SkipPrevious { auto_play: None }).await
}

async fn resume(State(app): State<AppState>) -> impl IntoResponse {
    dispatch(&app, Command::QueryResumption).await
}

async fn dispatch(app: &AppState, cmd: Command) -> (StatusCode, Json<CommandReply>) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let reply = if app
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd, Some(reply_tx)))
        .await
        .is_err()
    {
        CommandReply::Failed {
            reason: CommandFailure::PlayerUnavailable,
        }
    } else {
        reply_rx.await.unwrap_or(CommandReply::Failed {
            reason: CommandFailure::PlayerUnavailable,
        })
    };

    let status = match &reply {
        CommandReply::Failed {
            reason: CommandFailure::ItemNotFound,
        } => StatusCode::NOT_FOUND,
        CommandReply::Failed {
            reason: CommandFailure::PlayerUnavailable,
        } => StatusCode::SERVICE_UNAVAILABLE,
        CommandReply::Failed {
            reason: CommandFailure::UnsupportedCommand,
        } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (status, Json(reply))
}
