use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::camera::CameraSource;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Ordered camera URIs. The position in the list is the camera index; an
/// empty string marks a disabled slot.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_placeholder_path")]
    pub placeholder_path: String,
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    /// JPEG quality passed as `-q:v` (2 = best, 31 = worst).
    #[serde(default = "default_ffmpeg_quality")]
    pub quality: u32,
    /// Optional output frame-rate cap.
    #[serde(default)]
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            placeholder_path: default_placeholder_path(),
            idle_interval_ms: default_idle_interval(),
            frame_timeout_ms: default_frame_timeout(),
            stale_after_secs: default_stale_after(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
            rtsp_transport: default_rtsp_transport(),
            quality: default_ffmpeg_quality(),
            fps: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.idle_interval_ms == 0 {
            return Err(ConfigError::Invalid("stream.idle_interval_ms must be > 0".into()));
        }
        if self.stream.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stream.frame_timeout_ms must be > 0".into()));
        }
        if self.stream.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("stream.max_frame_bytes must be > 0".into()));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_backoff_ms must be > 0".into(),
            ));
        }
        if self.reconnect.initial_backoff() > self.reconnect.max_backoff() {
            return Err(ConfigError::Invalid(format!(
                "reconnect.initial_backoff_ms ({}) exceeds reconnect.max_backoff_secs ({})",
                self.reconnect.initial_backoff_ms, self.reconnect.max_backoff_secs
            )));
        }
        if self.reconnect.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("reconnect.read_timeout_secs must be > 0".into()));
        }
        if !(2..=31).contains(&self.ffmpeg.quality) {
            return Err(ConfigError::Invalid(format!(
                "ffmpeg.quality must be within 2..=31, got {}",
                self.ffmpeg.quality
            )));
        }
        Ok(())
    }

    /// The configured cameras in index order.
    pub fn cameras(&self) -> Vec<CameraSource> {
        self.sources
            .uris
            .iter()
            .enumerate()
            .map(|(index, uri)| CameraSource::new(index, uri.clone()))
            .collect()
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl StreamConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_port() -> u16 {
    5000
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_placeholder_path() -> String {
    "static/black.jpg".into()
}
fn default_idle_interval() -> u64 {
    500
}
fn default_frame_timeout() -> u64 {
    5000
}
fn default_stale_after() -> u64 {
    10
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    15
}
fn default_ffmpeg_binary() -> String {
    "ffmpeg".into()
}
fn default_rtsp_transport() -> String {
    "tcp".into()
}
fn default_ffmpeg_quality() -> u32 {
    5
}
fn default_log_level() -> String {
    "info".into()
}
