/// DaemonCore: single-owner event loop for all client-facing state.
///
/// Client commands (TCP socket, HTTP API) and engine events both arrive as
/// `DaemonEvent`s.  DaemonCore owns the `StateManager` writes and drives the
/// `PlaybackController`; no other task mutates either.
///
/// After each event that mutates state, DaemonCore broadcasts a
/// `BroadcastMessage` to all listeners via a `tokio::sync::broadcast`
/// channel.  The engine does its own timing (crossfades, health polls,
/// reconnects); this loop only mirrors what the engine reports.
use std::sync::Arc;
use std::time::Duration;

use ether_engine::encoding;
use ether_engine::{EngineEvent, MpvBackend, PlaybackController, PlaybackState};
use ether_proto::config::Config;
use ether_proto::protocol::{Command, HistoryItem, Station};
use ether_proto::state::{
    load_stations_from_m3u, load_stations_from_toml, map_station_text, parse_m3u_from_str,
    Settings, StateManager,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Forwarded from the engine's event channel.
    Engine(EngineEvent),
    /// Flush the settings store.
    AutosaveTick,
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    config: Config,
    state_manager: Arc<StateManager>,
    controller: PlaybackController<MpvBackend>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Start of the listening interval not yet credited to the settings store.
    listening_since: Option<Instant>,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let mut stations = load_stations(&config).await?;
        map_station_text(&mut stations, encoding::repair);

        let mut settings = Settings::load(&config.daemon.settings_file);
        settings.map_text(encoding::repair);
        info!(
            "Settings: volume {:.2}, {} favourites, {} history items",
            settings.volume,
            settings.favorites.len(),
            settings.play_history.len()
        );

        let mut engine_config = config.engine.clone();
        engine_config.default_volume = settings.volume;

        let state_manager = Arc::new(StateManager::new(
            config.daemon.settings_file.clone(),
            stations,
            settings,
        ));

        let backend = MpvBackend::start(&config.backend).await?;
        let controller = PlaybackController::new(backend, engine_config);

        Ok(Self {
            config,
            state_manager,
            controller,
            event_tx,
            broadcast_tx,
            listening_since: None,
        })
    }

    /// Borrow the state manager (for use by the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Engine handle for read-only diagnostics outside the loop.
    pub fn controller(&self) -> PlaybackController<MpvBackend> {
        self.controller.clone()
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        let mut engine_rx = self.controller.subscribe();
        let engine_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match engine_rx.recv().await {
                    Ok(evt) => {
                        if engine_tx.send(DaemonEvent::Engine(evt)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("DaemonCore: dropped {} engine events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let autosave_tx = self.event_tx.clone();
        let autosave_every = Duration::from_secs(self.config.daemon.autosave_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(autosave_every).await;
                if autosave_tx.send(DaemonEvent::AutosaveTick).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let evt = event_rx.recv().await;
            match evt {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }

                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }

                Some(DaemonEvent::ClientCommand(cmd)) => {
                    info!("DaemonCore: command {:?}", cmd);
                    if let Err(e) = self.handle_command(cmd).await {
                        error!("DaemonCore: command error: {}", e);
                    }
                }

                Some(DaemonEvent::Engine(evt)) => {
                    self.handle_engine_event(evt).await;
                }

                Some(DaemonEvent::AutosaveTick) => {
                    self.credit_listening_time(true).await;
                    if let Err(e) = self.state_manager.save().await {
                        warn!("DaemonCore: autosave failed: {}", e);
                    }
                }
            }
        }

        self.cleanup().await?;
        Ok(())
    }

    // ── engine event handler ──────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, evt: EngineEvent) {
        debug!("engine event: {:?}", evt);

        match evt {
            EngineEvent::StateChanged { state } => {
                self.state_manager.set_playback_state(state).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }

            EngineEvent::PlaybackStateChanged { is_playing } => {
                if is_playing {
                    self.listening_since.get_or_insert_with(Instant::now);
                } else {
                    self.credit_listening_time(false).await;
                }
                self.state_manager.set_is_playing(is_playing).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::Playback(is_playing));
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }

            EngineEvent::MetadataReceived {
                title,
                artist,
                source_url,
            } => {
                self.state_manager
                    .set_now_playing(title.clone(), artist.clone())
                    .await;
                self.record_history(&title, &artist, &source_url).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::Metadata {
                    title,
                    artist,
                    source_url,
                });
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }

            EngineEvent::ReconnectRequired { url } => {
                warn!("DaemonCore: stream {} dropped, engine is reconnecting", url);
                let _ = self.broadcast_tx.send(BroadcastMessage::Reconnecting(url));
            }
        }
    }

    /// Real track changes heard while playing go to the history.  The
    /// station-title fallback does not count as a track.
    async fn record_history(&self, title: &str, artist: &str, source_url: &str) {
        if title.is_empty() || self.controller.state() != PlaybackState::Playing {
            return;
        }
        let state = self.state_manager.get_state().await;
        let station_title = state
            .stations
            .iter()
            .find(|s| s.url == source_url)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source_url.to_string());
        if artist.is_empty() && (title == station_title || title == source_url) {
            return;
        }
        if let Some(last) = state.history.last() {
            if last.track_title == title && last.artist == artist {
                return;
            }
        }
        self.state_manager
            .push_history(HistoryItem {
                station_title,
                track_title: title.to_string(),
                artist: artist.to_string(),
                played_at: chrono::Local::now(),
            })
            .await;
    }

    /// Add the open listening interval to the store.  With `keep_running`
    /// the interval restarts now instead of closing.
    async fn credit_listening_time(&mut self, keep_running: bool) {
        let Some(since) = self.listening_since.take() else {
            return;
        };
        let now = Instant::now();
        self.state_manager
            .add_listening_time(now.duration_since(since))
            .await;
        if keep_running {
            self.listening_since = Some(now);
        }
    }

    // ── command handler ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { station_idx } => self.play_station(station_idx).await?,
            Command::PlayUrl { url } => self.play_url(url).await,
            Command::Pause => self.controller.pause().await,
            Command::Resume => self.controller.resume().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::Stop => self.stop().await,
            Command::Volume { value } => self.set_volume(value).await?,
            Command::AddStation { mut station } => {
                map_station_text(std::slice::from_mut(&mut station), encoding::repair);
                let idx = self.state_manager.add_station(station).await?;
                info!("Added station at {}", idx);
                self.state_manager.save().await?;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::RemoveStation { station_idx } => {
                let removed = self.state_manager.remove_station(station_idx).await?;
                info!("Removed station: {}", removed.name);
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::MoveStation { from, to } => {
                self.state_manager.move_station(from, to).await?;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::ToggleFavorite { station_idx } => {
                let now_favorite = self.state_manager.toggle_favorite(station_idx).await?;
                debug!("Station {} favourite: {}", station_idx, now_favorite);
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::GetDiagnostics => {
                let format = self.controller.current_format().await.map(|f| f.to_string());
                let headers = self.controller.http_headers().await;
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::Diagnostics { format, headers });
            }
            Command::GetState => {
                // State will be broadcast automatically
            }
        }
        Ok(())
    }

    async fn play_station(&mut self, idx: usize) -> anyhow::Result<()> {
        let Some(station) = self.state_manager.station(idx).await else {
            anyhow::bail!("station index {} out of range", idx);
        };
        info!("Playing station: {}", station.name);
        self.state_manager
            .set_connecting(Some(idx), station.url.clone(), &station.name)
            .await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        self.controller.play_station(&station.name, &station.url).await;
        Ok(())
    }

    async fn play_url(&mut self, url: String) {
        info!("Playing url: {}", url);
        self.state_manager
            .set_connecting(None, url.clone(), &url)
            .await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        self.controller.play(&url).await;
    }

    async fn toggle_pause(&mut self) {
        match self.controller.state() {
            PlaybackState::Paused => self.controller.resume().await,
            PlaybackState::Playing | PlaybackState::Stalled => self.controller.pause().await,
            _ => {}
        }
    }

    async fn stop(&mut self) {
        info!("Stopping playback");
        self.controller.stop().await;
        self.credit_listening_time(false).await;
        self.state_manager.set_stopped().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn set_volume(&mut self, value: f32) -> anyhow::Result<()> {
        let value = value.clamp(0.0, 1.0);
        self.controller.set_volume(value).await;
        self.state_manager.set_volume(value).await?;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        Ok(())
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    async fn cleanup(&mut self) -> anyhow::Result<()> {
        info!("DaemonCore: cleanup, stopping engine");
        self.controller.stop().await;
        self.credit_listening_time(false).await;
        self.state_manager.save().await
    }
}

// ── station loader ────────────────────────────────────────────────────────────

pub async fn load_stations(config: &Config) -> anyhow::Result<Vec<Station>> {
    use std::path::PathBuf;

    // 1. User config dir (highest priority)
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(s) => {
                info!(
                    "Loaded {} stations from TOML: {}",
                    s.len(),
                    toml_path.display()
                );
                return Ok(s);
            }
            Err(e) => warn!("Failed to parse TOML stations: {}", e),
        }
    }

    // 2. stations.toml beside the executable or in the working directory
    let candidates = ether_proto::platform::beside_exe("stations.toml")
        .into_iter()
        .chain(std::iter::once(PathBuf::from("stations.toml")));
    for path in candidates {
        if !path.exists() {
            continue;
        }
        match load_stations_from_toml(&path) {
            Ok(s) => {
                info!("Loaded {} stations from {}", s.len(), path.display());
                return Ok(s);
            }
            Err(e) => warn!("Failed to parse {}: {}", path.display(), e),
        }
    }

    // 3. m3u URL or file
    let source = &config.stations.m3u_url;
    if source.is_empty() {
        info!("No station source available, starting with empty list");
        return Ok(Vec::new());
    }
    info!("Loading stations from m3u: {}", source);

    if source.starts_with("http://") || source.starts_with("https://") {
        match fetch_m3u_url(source).await {
            Ok(s) => {
                info!("Loaded {} stations from URL", s.len());
                return Ok(s);
            }
            Err(e) => warn!("Failed to fetch stations from URL: {}", e),
        }
    } else {
        let path = PathBuf::from(source);
        if path.exists() {
            match load_stations_from_m3u(&path) {
                Ok(s) => {
                    info!("Loaded {} stations from m3u file", s.len());
                    return Ok(s);
                }
                Err(e) => warn!("Failed to read m3u file: {}", e),
            }
        }
    }

    info!("No station source available, starting with empty list");
    Ok(Vec::new())
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}
