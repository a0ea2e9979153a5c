use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { station_idx: usize },
    PlayUrl { url: String },
    Pause,
    Resume,
    TogglePause,
    Stop,
    Volume { value: f32 },
    AddStation { station: Station },
    RemoveStation { station_idx: usize },
    MoveStation { from: usize, to: usize },
    ToggleFavorite { station_idx: usize },
    /// Ask for a `Diagnostics` broadcast (stream format + response headers).
    GetDiagnostics,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Metadata {
        title: String,
        artist: String,
        source_url: String,
    },
    Playback {
        is_playing: bool,
    },
    Reconnecting {
        url: String,
    },
    Diagnostics {
        format: Option<String>,
        headers: Vec<(String, String)>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Engine-level playback state of the current stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Connecting,
    Playing,
    Paused,
    /// Buffer ran dry; the health monitor is deciding whether the connection died.
    Stalled,
    /// Reconnects exhausted.  Only an explicit play leaves this state.
    Failed,
}

impl PlaybackState {
    /// Audio is (or is about to be) audible.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlaybackState::Playing | PlaybackState::Stalled | PlaybackState::Paused
        )
    }
}

/// One entry of the play history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub station_title: String,
    pub track_title: String,
    #[serde(default)]
    pub artist: String,
    pub played_at: DateTime<Local>,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    /// Monotonic revision counter, incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub current_station: Option<usize>,
    pub current_url: Option<String>,
    pub volume: f32,
    /// Mirrors the engine's `PlaybackStateChanged` event.
    pub is_playing: bool,
    pub playback_state: PlaybackState,
    pub track_title: String,
    pub artist: String,
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub listening_time_hours: f64,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    pub name: String,
    pub url: String,
    /// Short description / blurb
    #[serde(default)]
    pub description: String,
    /// Parent network or brand (e.g. "SomaFM", "BBC")
    #[serde(default)]
    pub network: String,
    /// Searchable tags (genre, style, language, etc.)
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::PlayUrl {
            url: "http://example.com/live".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::PlayUrl { url }) => {
                assert_eq!(url, "http://example.com/live")
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_metadata_broadcast_keeps_cyrillic() {
        let msg = Message::Broadcast(Broadcast::Metadata {
            title: "Группа крови".into(),
            artist: "Кино".into(),
            source_url: "http://radio.example/kino".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Metadata { title, artist, .. }) => {
                assert_eq!(title, "Группа крови");
                assert_eq!(artist, "Кино");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = DaemonState {
            rev: 42,
            playback_state: PlaybackState::Stalled,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.playback_state, PlaybackState::Stalled);
            }
            _ => panic!("Wrong message type"),
        }
    }
}
