use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use ether_engine::{MpvBackend, PlaybackController};
use ether_proto::protocol::{Command, PlaybackState};
use ether_proto::state::StateManager;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    controller: PlaybackController<MpvBackend>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ApiState {
    stations: Vec<StationInfo>,
    current_station: Option<usize>,
    volume: f32,
    is_playing: bool,
    playback_state: PlaybackState,
    track_title: String,
    artist: String,
}

#[derive(Serialize)]
struct StationInfo {
    idx: usize,
    name: String,
    description: String,
    favorite: bool,
}

#[derive(Serialize)]
struct FormatInfo {
    format: Option<String>,
}

#[derive(Serialize)]
struct HeaderInfo {
    name: String,
    value: String,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    controller: PlaybackController<MpvBackend>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app_state = HttpState {
            state_manager,
            controller,
            event_tx,
        };

        let app = Router::new()
            .route("/api/state", get(get_state))
            .route("/api/play/:idx", get(play_station).post(play_station))
            .route("/api/pause", get(pause).post(pause))
            .route("/api/resume", get(resume).post(resume))
            .route("/api/stop", get(stop).post(stop))
            .route("/api/volume/:volume", get(set_volume).post(set_volume))
            .route("/api/format", get(get_format))
            .route("/api/headers", get(get_headers))
            .layer(CorsLayer::permissive())
            .with_state(app_state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: daemon event channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let daemon_state = state.state_manager.get_state().await;

    let stations = daemon_state
        .stations
        .iter()
        .enumerate()
        .map(|(idx, s)| StationInfo {
            idx,
            name: s.name.clone(),
            description: s.description.clone(),
            favorite: daemon_state.favorites.contains(&s.url),
        })
        .collect();

    Json(ApiState {
        stations,
        current_station: daemon_state.current_station,
        volume: daemon_state.volume,
        is_playing: daemon_state.is_playing,
        playback_state: daemon_state.playback_state,
        track_title: daemon_state.track_title,
        artist: daemon_state.artist,
    })
}

async fn play_station(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    info!("HTTP API: Play station {}", idx);
    if state.state_manager.station(idx).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    send(&state, Command::Play { station_idx: idx }).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Pause");
    send(&state, Command::Pause).await
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Resume");
    send(&state, Command::Resume).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Stop");
    send(&state, Command::Stop).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let vol = (volume as f32 / 100.0).clamp(0.0, 1.0);
    info!("HTTP API: Set volume to {}%", volume);
    send(&state, Command::Volume { value: vol }).await
}

async fn get_format(State(state): State<HttpState>) -> Json<FormatInfo> {
    let format = state
        .controller
        .current_format()
        .await
        .map(|f| f.to_string());
    Json(FormatInfo { format })
}

async fn get_headers(State(state): State<HttpState>) -> Json<Vec<HeaderInfo>> {
    let headers = state
        .controller
        .http_headers()
        .await
        .into_iter()
        .map(|(name, value)| HeaderInfo { name, value })
        .collect();
    Json(headers)
}
