use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub identify: IdentifyConfig,
    #[serde(default)]
    pub now_playing: NowPlayingConfig,
}

/// Client-facing TCP socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

/// Where the category/station catalog is read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path to a local TOML catalog (highest priority).
    /// Defaults to `$XDG_CONFIG_HOME/liveradio/catalog.toml`.
    #[serde(default = "default_catalog_toml")]
    pub catalog_toml: PathBuf,
    /// URL or file path for an m3u station list.  Empty disables it.
    #[serde(default)]
    pub m3u_url: String,
}

/// Selection policy consulted by the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Short name of the category selected on startup.
    #[serde(default = "default_category")]
    pub default_category: String,
    /// Pick a random station when switching category instead of the first.
    #[serde(default = "default_shuffle")]
    pub shuffle_on_category_change: bool,
}

/// Where the fingerprinting capture reads audio from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Live input device (ambient audio).
    #[default]
    Microphone,
    /// The currently selected station's stream.
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyConfig {
    /// Give up listening after this many seconds.
    #[serde(default = "default_identify_timeout")]
    pub timeout_secs: u64,
    /// Length of each capture window handed to the recognizer.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub source: CaptureSource,
    /// ffmpeg input format for microphone capture (`-f`).
    #[serde(default = "default_capture_format")]
    pub capture_format: String,
    /// ffmpeg input device for microphone capture (`-i`).
    #[serde(default = "default_capture_device")]
    pub capture_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingConfig {
    /// Optional JSON file mirroring the now-playing snapshot, for status bars.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    /// Register with the desktop media controls (MPRIS, SMTC, Now Playing).
    #[serde(default = "default_media_controls")]
    pub media_controls: bool,
}

impl Default for NowPlayingConfig {
    fn default() -> Self {
        Self {
            status_file: None,
            media_controls: default_media_controls(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_daemon_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalog_toml: default_catalog_toml(),
            m3u_url: String::new(),
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            default_category: default_category(),
            shuffle_on_category_change: default_shuffle(),
        }
    }
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_identify_timeout(),
            window_secs: default_window_secs(),
            source: CaptureSource::default(),
            capture_format: default_capture_format(),
            capture_device: default_capture_device(),
        }
    }
}

impl IdentifyConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_media_controls() -> bool {
    true
}

fn default_http_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.7
}

fn default_category() -> String {
    "JAZZ".to_string()
}

fn default_shuffle() -> bool {
    true
}

fn default_identify_timeout() -> u64 {
    12
}

fn default_window_secs() -> u64 {
    5
}

fn default_capture_format() -> String {
    #[cfg(target_os = "macos")]
    {
        "avfoundation".to_string()
    }
    #[cfg(windows)]
    {
        "dshow".to_string()
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    {
        "pulse".to_string()
    }
}

fn default_capture_device() -> String {
    #[cfg(target_os = "macos")]
    {
        ":0".to_string()
    }
    #[cfg(not(target_os = "macos"))]
    {
        "default".to_string()
    }
}

fn default_catalog_toml() -> PathBuf {
    platform::config_dir().join("catalog.toml")
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
        let config: Self = toml::from_str(&content)?;
        Ok(config)
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

    /// `host:port` of the daemon's client socket.
    pub fn daemon_address(&self) -> String {
        format!("{}:{}", self.daemon.bind_address, self.daemon.port)
    }
}
