//! Configuration management for the camera streaming core

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::memory::MemoryThresholds;
use crate::schedule::SchedulePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete streamer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Concurrent `/stream` connections accepted before answering 503
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Longest a single response write or flush may block on a slow client
    #[serde(default = "default_io_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Longest the server waits for a complete request line
    #[serde(default = "default_io_timeout_ms")]
    pub recv_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_streams: default_max_streams(),
            send_timeout_ms: default_io_timeout_ms(),
            recv_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Generated test frames, no hardware needed
    Synthetic,

    /// V4L2 MJPEG device (requires the `camera-v4l` feature)
    V4l2,
}

/// Camera and frame pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,

    /// Device path for the V4L2 source
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Frame buffers in the pool (1 = single-buffered, 2 = double-buffered)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// How long a capture waits for a free buffer or a fresh frame (0 = don't wait)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Payload size of synthetic frames
    #[serde(default = "default_synthetic_frame_bytes")]
    pub synthetic_frame_bytes: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            device: default_device(),
            width: default_width(),
            height: default_height(),
            buffer_count: default_buffer_count(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            synthetic_frame_bytes: default_synthetic_frame_bytes(),
        }
    }
}

impl CameraConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Frame-rate presets trading smoothness against control responsiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// ~5 FPS, control commands first
    Stable,

    /// ~10 FPS
    Balanced,

    /// ~15 FPS
    Smooth,
}

impl StreamMode {
    pub fn frame_delay_ms(self) -> u64 {
        match self {
            StreamMode::Stable => 200,
            StreamMode::Balanced => 100,
            StreamMode::Smooth => 66,
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamMode::Stable => "stable (5 FPS, control first)",
            StreamMode::Balanced => "balanced (10 FPS)",
            StreamMode::Smooth => "smooth (15 FPS)",
        };
        f.write_str(name)
    }
}

/// Stream pacing and scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_mode")]
    pub mode: StreamMode,

    /// Overrides the mode's inter-frame delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_delay_ms: Option<u64>,

    /// Multipart boundary token
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Explicit yield every N frames (0 disables)
    #[serde(default = "default_yield_interval_frames")]
    pub yield_interval_frames: u64,

    /// Extra delay added to every explicit yield
    #[serde(default = "default_extra_yield_delay_ms")]
    pub extra_yield_delay_ms: u64,

    /// Idle pause every M frames so transient allocations can be reclaimed (0 disables)
    #[serde(default = "default_settle_interval_frames")]
    pub settle_interval_frames: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Wait after a failed capture before trying again
    #[serde(default = "default_capture_backoff_ms")]
    pub capture_backoff_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            frame_delay_ms: None,
            boundary: default_boundary(),
            yield_interval_frames: default_yield_interval_frames(),
            extra_yield_delay_ms: default_extra_yield_delay_ms(),
            settle_interval_frames: default_settle_interval_frames(),
            settle_delay_ms: default_settle_delay_ms(),
            capture_backoff_ms: default_capture_backoff_ms(),
        }
    }
}

impl StreamConfig {
    /// Effective inter-frame delay
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms.unwrap_or_else(|| self.mode.frame_delay_ms()))
    }

    pub fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            frame_delay: self.frame_delay(),
            yield_every: self.yield_interval_frames,
            yield_delay: Duration::from_millis(self.extra_yield_delay_ms),
            settle_every: self.settle_interval_frames,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            capture_backoff: Duration::from_millis(self.capture_backoff_ms),
        }
    }
}

/// Memory watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Free bytes below which memory is reported as WARNING
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,

    /// Free bytes below which memory is reported as CRITICAL
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

impl MemoryConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn thresholds(&self) -> Result<MemoryThresholds, ConfigError> {
        MemoryThresholds::new(self.warning_threshold, self.critical_threshold)
    }
}

/// Snapshot endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshots closer together than this get a stabilization delay
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_stabilize_delay_ms")]
    pub stabilize_delay_ms: u64,

    /// Largest frame served; bigger frames are rejected
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            stabilize_delay_ms: default_stabilize_delay_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

// Default value functions
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_streams() -> usize {
    2
}
fn default_io_timeout_ms() -> u64 {
    5000
}
fn default_source() -> SourceKind {
    SourceKind::Synthetic
}
fn default_device() -> String {
    "/dev/video0".to_string()
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_buffer_count() -> usize {
    2
}
fn default_acquire_timeout_ms() -> u64 {
    1000
}
fn default_synthetic_frame_bytes() -> usize {
    16 * 1024
}
fn default_mode() -> StreamMode {
    StreamMode::Stable
}
fn default_boundary() -> String {
    "frame".to_string()
}
fn default_yield_interval_frames() -> u64 {
    1
}
fn default_extra_yield_delay_ms() -> u64 {
    50
}
fn default_settle_interval_frames() -> u64 {
    100
}
fn default_settle_delay_ms() -> u64 {
    10
}
fn default_capture_backoff_ms() -> u64 {
    20
}
fn default_check_interval_ms() -> u64 {
    5000
}
fn default_warning_threshold() -> u64 {
    100_000
}
fn default_critical_threshold() -> u64 {
    80_000
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_stabilize_delay_ms() -> u64 {
    100
}
fn default_max_frame_bytes() -> usize {
    256 * 1024
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.memory.thresholds()?;

        if self.memory.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "memory check_interval_ms must be > 0".to_string(),
            ));
        }

        if self.camera.buffer_count == 0 || self.camera.buffer_count > 8 {
            return Err(ConfigError::Invalid(format!(
                "camera buffer_count must be between 1 and 8, got {}",
                self.camera.buffer_count
            )));
        }

        let frame_delay = self.stream.frame_delay();
        let backoff = Duration::from_millis(self.stream.capture_backoff_ms);
        if !frame_delay.is_zero() && backoff >= frame_delay {
            return Err(ConfigError::Invalid(format!(
                "capture_backoff_ms ({}) must be shorter than the frame delay ({} ms)",
                self.stream.capture_backoff_ms,
                frame_delay.as_millis()
            )));
        }

        let boundary = &self.stream.boundary;
        if boundary.is_empty() || boundary.len() > 70 || boundary.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ConfigError::Invalid(format!(
                "stream boundary must be 1-70 characters without whitespace, got {:?}",
                boundary
            )));
        }

        if self.snapshot.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "snapshot max_frame_bytes must be > 0".to_string(),
            ));
        }

        if self.server.max_streams == 0 {
            return Err(ConfigError::Invalid(
                "server max_streams must be > 0".to_string(),
            ));
        }

        if self.server.send_timeout_ms == 0 || self.server.recv_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server send_timeout_ms and recv_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Logs the effective stream settings once at startup
    pub fn log_summary(&self) {
        info!("Stream mode: {}", self.stream.mode);
        info!("Frame delay: {} ms", self.stream.frame_delay().as_millis());
        info!(
            "Yield every {} frame(s) (+{} ms), settle every {} frame(s) ({} ms)",
            self.stream.yield_interval_frames,
            self.stream.extra_yield_delay_ms,
            self.stream.settle_interval_frames,
            self.stream.settle_delay_ms
        );
        info!(
            "Memory warning below {} bytes, critical below {} bytes, checked every {} ms",
            self.memory.warning_threshold, self.memory.critical_threshold, self.memory.check_interval_ms
        );
        info!(
            "Client timeouts: send {} ms, receive {} ms",
            self.server.send_timeout_ms, self.server.recv_timeout_ms
        );
        info!(
            "Camera source {:?}, {} frame buffer(s)",
            self.camera.source, self.camera.buffer_count
        );
    }
}
