use crate::assets::{
    ACCESSORY_READ_SIZE, DEFAULT_SERVER_IP, FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH,
    INPUT_SLOT_CAPACITY, MAX_FRAME_SIZE, PACING_MULTIPLIER, SERVER_PORT, SOCKET_READ_SIZE,
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Video codec the decoder is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Avc,
    Hevc,
}

impl CodecKind {
    /// MIME type of the elementary stream.
    pub fn mime(&self) -> &'static str {
        match self {
            CodecKind::Avc => "video/avc",
            CodecKind::Hevc => "video/hevc",
        }
    }

    /// Codec name as understood by FFmpeg.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            CodecKind::Avc => "h264",
            CodecKind::Hevc => "hevc",
        }
    }

    pub fn parse(name: &str) -> Option<CodecKind> {
        match name.to_lowercase().as_str() {
            "avc" | "h264" | "video/avc" => Some(CodecKind::Avc),
            "hevc" | "h265" | "video/hevc" => Some(CodecKind::Hevc),
            _ => None,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime())
    }
}

/// Where the byte stream comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP connection to the producing server, length-prefixed frames.
    Socket { address: IpAddr, port: u16 },
    /// Accessory device node or file descriptor path, short-read framing.
    Accessory { path: PathBuf },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Socket {
            address: default_address(),
            port: SERVER_PORT,
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Socket { address, port } => write!(f, "socket {}:{}", address, port),
            TransportConfig::Accessory { path } => write!(f, "accessory {}", path.display()),
        }
    }
}

/// How presentation timestamps are assigned to submitted frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PtsMode {
    /// `multiplier * k / rate`, rate taken from the live throughput estimate.
    Paced { multiplier: u64 },
    /// Microseconds elapsed since the session started streaming.
    Monotonic,
}

impl Default for PtsMode {
    fn default() -> Self {
        PtsMode::Paced {
            multiplier: PACING_MULTIPLIER,
        }
    }
}

/// Immutable configuration of one decode-feed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    pub max_frame_size: usize,
    pub slot_capacity: usize,
    pub socket_read_size: usize,
    pub accessory_read_size: usize,
    pub pts_mode: PtsMode,
    pub default_frame_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transport: TransportConfig::default(),
            codec: CodecKind::Avc,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            max_frame_size: MAX_FRAME_SIZE,
            slot_capacity: INPUT_SLOT_CAPACITY,
            socket_read_size: SOCKET_READ_SIZE,
            accessory_read_size: ACCESSORY_READ_SIZE,
            pts_mode: PtsMode::default(),
            default_frame_rate: FRAME_RATE,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("Resolution must be non-zero"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > i32::MAX as usize {
            return Err(anyhow!(
                "Max frame size must be between 1 and {}",
                i32::MAX
            ));
        }
        if self.slot_capacity == 0 {
            return Err(anyhow!("Slot capacity must be at least 1"));
        }
        if self.socket_read_size == 0 || self.accessory_read_size == 0 {
            return Err(anyhow!("Read sizes must be non-zero"));
        }
        // A full USB read must fit the accumulation buffer
        if self.accessory_read_size > self.max_frame_size {
            return Err(anyhow!(
                "Accessory read size {} exceeds max frame size {}",
                self.accessory_read_size,
                self.max_frame_size
            ));
        }
        if self.default_frame_rate == 0 {
            return Err(anyhow!("Default frame rate must be non-zero"));
        }
        Ok(())
    }
}

pub fn default_address() -> IpAddr {
    DEFAULT_SERVER_IP
        .parse()
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
