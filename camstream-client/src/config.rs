//! Configuration for the camstream producer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camstream_core::capture::FrameTarget;
use camstream_core::{CamError, FrameFormat};

use crate::session::SessionOptions;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Collector address.
    pub network: NetworkConfig,
    /// Capture device settings.
    pub device: DeviceConfig,
    /// Capture run settings.
    pub capture: CaptureConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Collector host.
    pub host: String,
    /// Collector TCP port. The positional CLI argument overrides it.
    pub port: u16,
}

/// Capture device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device node.
    pub path: String,
    pub width: u32,
    pub height: u32,
    /// Four-character pixel encoding code.
    pub fourcc: String,
    /// Buffers to request from the driver.
    pub buffers: u32,
    /// Bound on a single readiness wait, in seconds.
    pub wait_timeout_secs: u64,
}

/// Capture run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// First component of the descriptor, e.g. `Webcam` in
    /// `Webcam_640_480_3.mjpeg`.
    pub descriptor_prefix: String,
    /// Frame period of the `--synthetic` device, in milliseconds.
    pub synthetic_interval_ms: u64,
    /// Body length of each `--synthetic` frame.
    pub synthetic_payload_len: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9000,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/video0".into(),
            width: 640,
            height: 480,
            fourcc: "MJPG".into(),
            buffers: camstream_core::REQUESTED_BUFFERS,
            wait_timeout_secs: 5,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            descriptor_prefix: "Webcam".into(),
            synthetic_interval_ms: 33,
            synthetic_payload_len: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// `host:port` of the collector.
    pub fn collector_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    /// Requested capture format.
    pub fn frame_format(&self) -> Result<FrameFormat, CamError> {
        let fourcc: [u8; 4] = self
            .device
            .fourcc
            .as_bytes()
            .try_into()
            .map_err(|_| {
                CamError::Unsupported(format!(
                    "pixel format {:?} is not a four-character code",
                    self.device.fourcc
                ))
            })?;
        Ok(FrameFormat {
            width: self.device.width,
            height: self.device.height,
            fourcc,
        })
    }

    /// Convert settings into the options of one capture run.
    pub fn to_session_options(&self, target: FrameTarget) -> Result<SessionOptions, CamError> {
        Ok(SessionOptions {
            addr: self.collector_addr(),
            format: self.frame_format()?,
            target,
            buffers: self.device.buffers.max(camstream_core::MIN_BUFFERS),
            wait_timeout: Duration::from_secs(self.device.wait_timeout_secs.max(1)),
            descriptor_prefix: self.capture.descriptor_prefix.clone(),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
