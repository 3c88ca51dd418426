//! Configuration management for klipper-watch

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::notify::chat::ChatId;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Moonraker connection settings
    #[serde(default)]
    pub moonraker: MoonrakerConfig,

    /// Telegram delivery settings
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Camera snapshot settings
    #[serde(default)]
    pub camera: CameraConfig,

    /// Auxiliary light used while capturing
    #[serde(default)]
    pub light: LightConfig,

    /// Progress notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Timelapse capture and assembly settings
    #[serde(default)]
    pub timelapse: TimelapseConfig,

    /// Which lines go into status messages
    #[serde(default)]
    pub status_message: StatusMessageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoonrakerConfig {
    /// Moonraker host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// Moonraker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use https/wss
    #[serde(default)]
    pub ssl: bool,

    /// Verify TLS certificates when `ssl` is set
    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// API key sent as `X-Api-Key`
    #[serde(default)]
    pub api_token: Option<String>,

    /// User name for JWT login
    #[serde(default)]
    pub user: Option<String>,

    /// Password for JWT login
    #[serde(default)]
    pub password: Option<String>,

    /// Base delay before reopening a dropped event stream (seconds)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Printer objects to subscribe to in addition to the built-in topics,
    /// e.g. `"extruder"`, `"heater_bed"`, `"temperature_sensor chamber"`
    #[serde(default)]
    pub sensors: Vec<String>,

    /// Moonraker power device switched on while the camera captures
    #[serde(default)]
    pub light_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Primary chat receiving all messages
    #[serde(default)]
    pub chat_id: Option<ChatId>,

    /// Bot API base URL
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Whether photos are attached and timelapse frames captured
    #[serde(default)]
    pub enabled: bool,

    /// URL returning a single JPEG frame (e.g. `http://localhost/webcam/?action=snapshot`)
    #[serde(default)]
    pub snapshot_url: Option<String>,

    /// Snapshot request timeout (seconds)
    #[serde(default = "default_snapshot_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightConfig {
    /// Delay after switching the light on before capturing, and grace period
    /// before switching it off again (seconds). 0 disables light control.
    #[serde(default)]
    pub settle_delay_secs: u64,

    /// Upper bound on waiting for another capture to finish switching the light on (seconds)
    #[serde(default = "default_light_confirm_timeout")]
    pub confirm_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Send print start/finish messages
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Notify every N percent (0 = disabled)
    #[serde(default)]
    pub percent: u32,

    /// Notify every N millimetres of height (0 = disabled)
    #[serde(default)]
    pub height: f64,

    /// Periodic status notification interval (seconds, 0 = disabled)
    #[serde(default)]
    pub interval_secs: u64,

    /// Minimum time between two progress notifications (seconds)
    #[serde(default)]
    pub min_interval_secs: u64,

    /// Additional chats receiving progress notifications
    #[serde(default)]
    pub groups: Vec<ChatId>,

    /// Send progress notifications only to groups
    #[serde(default)]
    pub group_only: bool,

    /// Send a status update whenever the display (M117) message changes
    #[serde(default)]
    pub m117_update: bool,

    #[serde(default)]
    pub silent_progress: bool,

    #[serde(default)]
    pub silent_commands: bool,

    #[serde(default)]
    pub silent_status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    /// Whether timelapse capture is enabled (requires the camera)
    #[serde(default)]
    pub enabled: bool,

    /// Capture only between `timelapse start` / `timelapse stop` gcode triggers
    #[serde(default)]
    pub manual_mode: bool,

    /// Capture every N millimetres of height (0 = disabled)
    #[serde(default)]
    pub height: f64,

    /// Capture every N seconds (0 = disabled)
    #[serde(default)]
    pub interval_secs: u64,

    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Stretch short lapses to at least this many seconds (0 = off)
    #[serde(default)]
    pub min_lapse_duration: u32,

    /// Compress long lapses to at most this many seconds (0 = off)
    #[serde(default)]
    pub max_lapse_duration: u32,

    /// Seconds the last frame is held at the end of the video
    #[serde(default = "default_last_frame_duration")]
    pub last_frame_duration: u32,

    /// Directory where frames are collected per print job
    #[serde(default = "default_timelapse_dir")]
    pub base_dir: PathBuf,

    /// Directory finished videos are copied to
    #[serde(default)]
    pub ready_dir: Option<PathBuf>,

    /// Remove frames of cancelled or restarted jobs
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// Upload the finished video to the chat
    #[serde(default = "default_true")]
    pub send_finished_lapse: bool,

    /// Gcode executed after the video is assembled
    #[serde(default)]
    pub after_lapse_gcode: Option<String>,

    /// Gcode executed after `timelapse photo_and_gcode` frames
    #[serde(default)]
    pub after_photo_gcode: Option<String>,

    /// ffmpeg binary used for assembly
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
}

/// Parts a status message is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPart {
    Progress,
    Height,
    FilamentLength,
    FilamentWeight,
    PrintDuration,
    Eta,
    FinishTime,
    M117Status,
    TgnotifyStatus,
    LastUpdateTime,
}

/// Where the estimated time left comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtaSource {
    /// Slicer estimate minus elapsed print time
    #[default]
    Slicer,
    /// Extrapolated from file position
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessageConfig {
    #[serde(default = "default_status_content")]
    pub content: Vec<StatusPart>,

    #[serde(default)]
    pub eta_source: EtaSource,

    /// Power devices listed in status messages
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Default to debug level when RUST_LOG is not set
    #[serde(default)]
    pub debug: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

// Default value functions
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7125
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    2
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_snapshot_timeout() -> u64 {
    5
}

fn default_light_confirm_timeout() -> u64 {
    10
}

fn default_target_fps() -> u32 {
    15
}

fn default_last_frame_duration() -> u32 {
    5
}

fn default_timelapse_dir() -> PathBuf {
    std::env::temp_dir().join("klipper-watch-timelapse")
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_status_content() -> Vec<StatusPart> {
    vec![
        StatusPart::Progress,
        StatusPart::Height,
        StatusPart::FilamentLength,
        StatusPart::FilamentWeight,
        StatusPart::PrintDuration,
        StatusPart::Eta,
        StatusPart::FinishTime,
        StatusPart::M117Status,
        StatusPart::TgnotifyStatus,
    ]
}

impl Default for MoonrakerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl: false,
            ssl_verify: true,
            api_token: None,
            user: None,
            password: None,
            reconnect_interval_secs: default_reconnect_interval(),
            sensors: Vec::new(),
            light_device: None,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_url: None,
            timeout_secs: default_snapshot_timeout(),
        }
    }
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 0,
            confirm_timeout_secs: default_light_confirm_timeout(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percent: 0,
            height: 0.0,
            interval_secs: 0,
            min_interval_secs: 0,
            groups: Vec::new(),
            group_only: false,
            m117_update: false,
            silent_progress: false,
            silent_commands: false,
            silent_status: false,
        }
    }
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            manual_mode: false,
            height: 0.0,
            interval_secs: 0,
            target_fps: default_target_fps(),
            min_lapse_duration: 0,
            max_lapse_duration: 0,
            last_frame_duration: default_last_frame_duration(),
            base_dir: default_timelapse_dir(),
            ready_dir: None,
            cleanup: true,
            send_finished_lapse: true,
            after_lapse_gcode: None,
            after_photo_gcode: None,
            ffmpeg_path: default_ffmpeg(),
        }
    }
}

impl Default for StatusMessageConfig {
    fn default() -> Self {
        Self {
            content: default_status_content(),
            eta_source: EtaSource::default(),
            devices: Vec::new(),
        }
    }
}

impl MoonrakerConfig {
    /// Base URL for REST calls
    pub fn http_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Websocket endpoint, optionally carrying a one-shot token
    pub fn websocket_url(&self, oneshot_token: Option<&str>) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        match oneshot_token {
            Some(token) => format!("{}://{}:{}/websocket?token={}", scheme, self.host, self.port, token),
            None => format!("{}://{}:{}/websocket", scheme, self.host, self.port),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default config file is created with default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_config_path()?, false),
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else if explicit {
            bail!("Config file not found: {:?}", config_path);
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "klipper-watch", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Check that the settings needed to run are present and sane
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.as_deref().unwrap_or("").is_empty() {
            bail!("telegram.bot_token is not set in {:?}", self.config_path().ok());
        }
        if self.telegram.chat_id.is_none() {
            bail!("telegram.chat_id is not set in {:?}", self.config_path().ok());
        }
        if self.timelapse.target_fps == 0 {
            bail!("timelapse.target_fps must be at least 1");
        }
        if self.notifications.height < 0.0 || self.timelapse.height < 0.0 {
            bail!("height thresholds must not be negative");
        }
        if self.camera.enabled && self.camera.snapshot_url.is_none() {
            bail!("camera.enabled requires camera.snapshot_url");
        }
        Ok(())
    }

    /// Whether the camera can actually be used
    pub fn camera_available(&self) -> bool {
        self.camera.enabled && self.camera.snapshot_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.moonraker.port, 7125);
        assert_eq!(config.moonraker.reconnect_interval_secs, 2);
        assert_eq!(config.timelapse.target_fps, 15);
        assert!(config.notifications.enabled);
        assert_eq!(config.status_message.eta_source, EtaSource::Slicer);
    }

    #[test]
    fn test_sections_parse() {
        let config = Config::from_toml(
            r#"
            [moonraker]
            host = "printer.local"
            ssl = true
            sensors = ["extruder", "temperature_sensor chamber"]

            [telegram]
            bot_token = "123:abc"
            chat_id = 42

            [notifications]
            percent = 10
            height = 5.0
            groups = [-100, -200]

            [status_message]
            content = ["progress", "eta"]
            eta_source = "file"
            "#,
        )
        .unwrap();

        assert_eq!(config.moonraker.http_url(), "https://printer.local:7125");
        assert_eq!(
            config.moonraker.websocket_url(Some("tok")),
            "wss://printer.local:7125/websocket?token=tok"
        );
        assert_eq!(config.moonraker.sensors.len(), 2);
        assert_eq!(config.notifications.groups, vec![-100, -200]);
        assert_eq!(
            config.status_message.content,
            vec![StatusPart::Progress, StatusPart::Eta]
        );
        assert_eq!(config.status_message.eta_source, EtaSource::File);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_telegram() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_nothing_for_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[telegram]\nchat_id = 7\n").unwrap();

        let mut config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.telegram.chat_id, Some(7));
        config.notifications.percent = 25;
        config.save().unwrap();

        let reloaded = Config::load(Some(&path)).unwrap();
        assert_eq!(reloaded.notifications.percent, 25);
    }
}
