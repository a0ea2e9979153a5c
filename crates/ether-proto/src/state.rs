use crate::protocol::{DaemonState, HistoryItem, PlaybackState, Station};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Most recent entries kept in the play history.
pub const HISTORY_LIMIT: usize = 100;

// ── Settings store ────────────────────────────────────────────────────────────

/// Opaque window placement, persisted for whichever UI is attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowGeometry {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub maximized: bool,
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Favourite stations, by URL.
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub last_station_url: Option<String>,
    #[serde(default)]
    pub listening_time_hours: f64,
    #[serde(default)]
    pub play_history: Vec<HistoryItem>,
    #[serde(default)]
    pub window: Option<WindowGeometry>,
}

fn default_volume() -> f32 {
    0.5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            favorites: Vec::new(),
            last_station_url: None,
            listening_time_hours: 0.0,
            play_history: Vec::new(),
            window: None,
        }
    }
}

impl Settings {
    /// Missing or unreadable files yield defaults; a corrupt store must never
    /// keep the daemon from starting.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Settings>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Settings file {} is corrupt: {}", path.display(), e);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Run every persisted free-text field through `f`.  Used to repair
    /// history entries written under a wrong code page.
    pub fn map_text(&mut self, f: impl Fn(&str) -> String) {
        for item in &mut self.play_history {
            item.station_title = f(&item.station_title);
            item.track_title = f(&item.track_title);
            item.artist = f(&item.artist);
        }
    }
}

fn push_capped(history: &mut Vec<HistoryItem>, item: HistoryItem) {
    history.push(item);
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// Apply `f` to the human-readable fields of every station.
pub fn map_station_text(stations: &mut [Station], f: impl Fn(&str) -> String) {
    for s in stations {
        s.name = f(&s.name);
        s.description = f(&s.description);
    }
}

// ── StateManager ──────────────────────────────────────────────────────────────

pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
    settings_file: PathBuf,
    window: Option<WindowGeometry>,
}

impl StateManager {
    pub fn new(settings_file: PathBuf, stations: Vec<Station>, settings: Settings) -> Self {
        let current_station = settings
            .last_station_url
            .as_deref()
            .and_then(|url| stations.iter().position(|s| s.url == url));

        let state = DaemonState {
            rev: 1,
            stations,
            current_station,
            current_url: None,
            volume: settings.volume.clamp(0.0, 1.0),
            is_playing: false,
            playback_state: PlaybackState::Stopped,
            track_title: String::new(),
            artist: String::new(),
            favorites: settings.favorites,
            listening_time_hours: settings.listening_time_hours,
            history: settings.play_history,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            settings_file,
            window: settings.window,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<DaemonState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn station(&self, idx: usize) -> Option<Station> {
        self.state.read().await.stations.get(idx).cloned()
    }

    /// A new stream was requested.  The placeholder is shown until metadata
    /// or the empty-metadata fallback replaces it.
    pub async fn set_connecting(&self, idx: Option<usize>, url: String, placeholder: &str) {
        let mut state = self.state.write().await;
        if idx.is_some() {
            state.current_station = idx;
        } else {
            state.current_station = state.stations.iter().position(|s| s.url == url);
        }
        state.current_url = Some(url);
        state.playback_state = PlaybackState::Connecting;
        state.track_title = placeholder.to_string();
        state.artist.clear();
        state.rev += 1;
    }

    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.is_playing = false;
        state.playback_state = PlaybackState::Stopped;
        state.current_url = None;
        state.track_title.clear();
        state.artist.clear();
        state.rev += 1;
    }

    pub async fn set_playback_state(&self, playback_state: PlaybackState) {
        let mut state = self.state.write().await;
        state.playback_state = playback_state;
        state.rev += 1;
    }

    pub async fn set_is_playing(&self, is_playing: bool) {
        let mut state = self.state.write().await;
        state.is_playing = is_playing;
        state.rev += 1;
    }

    pub async fn set_now_playing(&self, title: String, artist: String) {
        let mut state = self.state.write().await;
        state.track_title = title;
        state.artist = artist;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn push_history(&self, item: HistoryItem) {
        let mut state = self.state.write().await;
        push_capped(&mut state.history, item);
        state.rev += 1;
    }

    /// Listening time is tracked silently; no rev bump.
    pub async fn add_listening_time(&self, elapsed: Duration) {
        let mut state = self.state.write().await;
        state.listening_time_hours += elapsed.as_secs_f64() / 3600.0;
    }

    // ── station directory ─────────────────────────────────────────────────────

    pub async fn add_station(&self, station: Station) -> anyhow::Result<usize> {
        let idx = {
            let mut state = self.state.write().await;
            if state.stations.iter().any(|s| s.url == station.url) {
                anyhow::bail!("station with url {} already exists", station.url);
            }
            state.stations.push(station);
            state.rev += 1;
            state.stations.len() - 1
        };
        Ok(idx)
    }

    pub async fn remove_station(&self, idx: usize) -> anyhow::Result<Station> {
        let removed = {
            let mut state = self.state.write().await;
            if idx >= state.stations.len() {
                anyhow::bail!("station index {} out of range", idx);
            }
            let removed = state.stations.remove(idx);
            state.current_station = match state.current_station {
                Some(cur) if cur == idx => None,
                Some(cur) if cur > idx => Some(cur - 1),
                other => other,
            };
            state.favorites.retain(|url| url != &removed.url);
            state.rev += 1;
            removed
        };
        self.save().await?;
        Ok(removed)
    }

    /// Reorder: the station at `from` ends up at `to`.
    pub async fn move_station(&self, from: usize, to: usize) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let len = state.stations.len();
        if from >= len || to >= len {
            anyhow::bail!("station move {} -> {} out of range (have {})", from, to, len);
        }
        if from == to {
            return Ok(());
        }
        let station = state.stations.remove(from);
        state.stations.insert(to, station);
        state.current_station = state.current_station.map(|cur| {
            if cur == from {
                to
            } else if from < cur && cur <= to {
                cur - 1
            } else if to <= cur && cur < from {
                cur + 1
            } else {
                cur
            }
        });
        state.rev += 1;
        Ok(())
    }

    /// Returns whether the station is a favourite afterwards.
    pub async fn toggle_favorite(&self, idx: usize) -> anyhow::Result<bool> {
        let now_favorite = {
            let mut state = self.state.write().await;
            let url = match state.stations.get(idx) {
                Some(s) => s.url.clone(),
                None => anyhow::bail!("station index {} out of range", idx),
            };
            let now_favorite = if let Some(pos) = state.favorites.iter().position(|u| *u == url) {
                state.favorites.remove(pos);
                false
            } else {
                state.favorites.push(url);
                true
            };
            state.rev += 1;
            now_favorite
        };
        self.save().await?;
        Ok(now_favorite)
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let settings = {
            let state = self.state.read().await;
            Settings {
                volume: state.volume,
                favorites: state.favorites.clone(),
                last_station_url: state
                    .current_station
                    .and_then(|idx| state.stations.get(idx))
                    .map(|s| s.url.clone()),
                listening_time_hours: state.listening_time_hours,
                play_history: state.history.clone(),
                window: self.window.clone(),
            }
        };
        settings.save(&self.settings_file).await
    }
}

// ── m3u station loader ────────────────────────────────────────────────────────

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());

        stations.push(Station {
            name,
            url,
            ..Station::default()
        });
    }

    Ok(stations)
}

pub fn load_stations_from_m3u(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Matches the `[[station]]` table.  Kept apart from `Station` so the file
/// schema can diverge from the wire struct.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    name: String,
    url: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    city: String,
    #[serde(default)]
    country: String,
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| Station {
            name: s.name,
            url: s.url,
            network: s.network,
            description: s.description,
            tags: s.tags,
            city: s.city,
            country: s.country,
        })
        .collect();
    Ok(stations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn station(name: &str) -> Station {
        Station {
            name: name.to_string(),
            url: format!("http://radio.example/{}", name),
            ..Station::default()
        }
    }

    fn manager(stations: Vec<Station>) -> StateManager {
        let file = std::env::temp_dir().join("ether-state-unit-test.json");
        StateManager::new(file, stations, Settings::default())
    }

    fn history_item(n: usize) -> HistoryItem {
        HistoryItem {
            station_title: "Station".into(),
            track_title: format!("Track {}", n),
            artist: String::new(),
            played_at: Local::now(),
        }
    }

    #[test]
    fn test_parse_m3u() {
        let content = "#EXTM3U\n#EXTINF:-1,Radio One\nhttp://one.example/live\n\nhttp://two.example/live\n";
        let stations = parse_m3u_from_str(content).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "Radio One");
        assert_eq!(stations[1].name, "http://two.example/live");
    }

    #[test]
    fn test_parse_toml_stations() {
        let content = r#"
[[station]]
name = "Радио Рекорд"
url = "http://radiorecord.example/live"
tags = ["dance"]

[[station]]
name = "Soma Groove"
url = "http://soma.example/groove"
network = "SomaFM"
"#;
        let stations = parse_stations_from_toml_str(content).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "Радио Рекорд");
        assert_eq!(stations[1].network, "SomaFM");
    }

    #[test]
    fn test_history_is_capped() {
        let mut history = Vec::new();
        for n in 0..HISTORY_LIMIT + 5 {
            push_capped(&mut history, history_item(n));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].track_title, "Track 5");
        assert_eq!(
            history.last().unwrap().track_title,
            format!("Track {}", HISTORY_LIMIT + 4)
        );
    }

    #[test]
    fn test_settings_map_text() {
        let mut settings = Settings::default();
        settings.play_history.push(history_item(1));
        settings.map_text(|s| s.to_uppercase());
        assert_eq!(settings.play_history[0].track_title, "TRACK 1");
        assert_eq!(settings.play_history[0].station_title, "STATION");
    }

    #[tokio::test]
    async fn test_move_station_tracks_current() {
        let sm = manager(vec![station("a"), station("b"), station("c"), station("d")]);
        sm.set_connecting(Some(1), "http://radio.example/b".into(), "…")
            .await;

        sm.move_station(1, 3).await.unwrap();
        let state = sm.get_state().await;
        assert_eq!(state.current_station, Some(3));
        assert_eq!(state.stations[3].name, "b");

        sm.move_station(0, 3).await.unwrap();
        let state = sm.get_state().await;
        assert_eq!(state.current_station, Some(2));
        assert_eq!(state.stations[2].name, "b");

        assert!(sm.move_station(0, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_set_connecting_resolves_station_by_url() {
        let sm = manager(vec![station("a"), station("b")]);
        sm.set_connecting(None, "http://radio.example/b".into(), "Connecting…")
            .await;
        let state = sm.get_state().await;
        assert_eq!(state.current_station, Some(1));
        assert_eq!(state.track_title, "Connecting…");
        assert_eq!(state.playback_state, PlaybackState::Connecting);
    }

    #[tokio::test]
    async fn test_add_station_rejects_duplicate_url() {
        let sm = manager(vec![station("a")]);
        assert!(sm.add_station(station("a")).await.is_err());
        assert_eq!(sm.add_station(station("b")).await.unwrap(), 1);
    }
}
