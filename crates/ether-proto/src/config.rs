use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub stations: StationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Settings store: volume, favourites, history, listening time.
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    /// How often the settings store is flushed while the daemon runs.
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Timings and limits of the streaming engine.  Everything is in
/// milliseconds unless the field name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    #[serde(default = "default_crossfade_step_ms")]
    pub crossfade_step_ms: u64,
    /// Pause after a crossfade before the retired handle is torn down.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_open_retry_ms")]
    pub open_retry_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
    /// A channel reporting Playing earlier than this is not trusted yet.
    #[serde(default = "default_min_ready_ms")]
    pub min_ready_ms: u64,
    #[serde(default = "default_health_poll_secs")]
    pub health_poll_secs: u64,
    #[serde(default = "default_metadata_poll_secs")]
    pub metadata_poll_secs: u64,
    #[serde(default = "default_stall_grace_secs")]
    pub stall_grace_secs: u64,
    #[serde(default = "default_stall_frozen_secs")]
    pub stall_frozen_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub metadata_debounce_ms: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Explicit mpv binary.  Searched beside the executable and on PATH when unset.
    #[serde(default)]
    pub mpv_binary: Option<PathBuf>,
    #[serde(default = "default_bind_address")]
    pub tap_bind_address: String,
    #[serde(default = "default_tap_port")]
    pub tap_port: u16,
}

/// Station list source: an https:// URL or a local file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file (highest priority).
    /// Defaults to `$XDG_CONFIG_HOME/ether/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u station list (fallback when TOML not found).
    #[serde(default)]
    pub m3u_url: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            settings_file: default_settings_file(),
            autosave_secs: default_autosave_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            crossfade_ms: default_crossfade_ms(),
            crossfade_step_ms: default_crossfade_step_ms(),
            settle_ms: default_settle_ms(),
            open_retry_ms: default_open_retry_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            ready_poll_ms: default_ready_poll_ms(),
            min_ready_ms: default_min_ready_ms(),
            health_poll_secs: default_health_poll_secs(),
            metadata_poll_secs: default_metadata_poll_secs(),
            stall_grace_secs: default_stall_grace_secs(),
            stall_frozen_secs: default_stall_frozen_secs(),
            metadata_debounce_ms: default_debounce_ms(),
            connection_timeout_secs: default_connection_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl EngineConfig {
    pub fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms)
    }

    pub fn crossfade_step(&self) -> Duration {
        Duration::from_millis(self.crossfade_step_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    pub fn min_ready(&self) -> Duration {
        Duration::from_millis(self.min_ready_ms)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs.max(1))
    }

    pub fn metadata_poll(&self) -> Duration {
        Duration::from_secs(self.metadata_poll_secs.max(1))
    }

    pub fn stall_grace(&self) -> Duration {
        Duration::from_secs(self.stall_grace_secs)
    }

    pub fn stall_frozen(&self) -> Duration {
        Duration::from_secs(self.stall_frozen_secs)
    }

    pub fn metadata_debounce(&self) -> Duration {
        Duration::from_millis(self.metadata_debounce_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Linear backoff: `reconnect_backoff_ms × attempt`.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms * u64::from(attempt))
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mpv_binary: None,
            tap_bind_address: default_bind_address(),
            tap_port: default_tap_port(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_autosave_secs() -> u64 {
    30
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_tap_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.5
}

fn default_crossfade_ms() -> u64 {
    1500
}

fn default_crossfade_step_ms() -> u64 {
    30
}

fn default_settle_ms() -> u64 {
    500
}

fn default_open_retry_ms() -> u64 {
    200
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_ready_poll_ms() -> u64 {
    100
}

fn default_min_ready_ms() -> u64 {
    300
}

fn default_health_poll_secs() -> u64 {
    3
}

fn default_metadata_poll_secs() -> u64 {
    5
}

fn default_stall_grace_secs() -> u64 {
    10
}

fn default_stall_frozen_secs() -> u64 {
    5
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_connection_timeout_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

fn default_stations_toml() -> PathBuf {
    // On Windows, check for portable stations.toml in executable directory
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_stations = exe_dir.join("stations.toml");
                if portable_stations.exists() {
                    return portable_stations;
                }
            }
        }
    }

    platform::config_dir().join("stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.backend.tap_port, 8990);
        assert!(config
            .stations
            .stations_toml
            .ends_with("ether/stations.toml"));
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.crossfade(), Duration::from_millis(1500));
        assert_eq!(engine.ready_timeout(), Duration::from_secs(10));
        assert_eq!(engine.health_poll(), Duration::from_secs(3));
        assert_eq!(engine.metadata_poll(), Duration::from_secs(5));
        assert_eq!(engine.max_reconnect_attempts, 3);
        assert_eq!(engine.reconnect_backoff(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_partial_engine_section_keeps_defaults() {
        let config = Config::from_toml_str("[engine]\ncrossfade_ms = 900\n").unwrap();
        assert_eq!(config.engine.crossfade_ms, 900);
        assert_eq!(config.engine.metadata_debounce_ms, 300);
        assert_eq!(config.engine.max_reconnect_attempts, 3);
        assert!(config.http.enabled);
    }
}
