use std::path::Path;

use serde::Deserialize;

/// Server configuration loaded from a TOML file; CLI flags override it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to.
    pub bind_addr: String,

    /// Primary listener port.
    pub port: u16,

    /// Secondary listener port.
    pub alt_port: u16,

    /// Maximum simultaneously connected viewers.
    pub max_clients: usize,

    /// Capture settings
    pub capture: CaptureConfig,

    /// Encoding settings
    pub encode: EncodeConfig,

    /// Audio settings
    pub audio: AudioConfig,

    /// Queue tuning
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target frames per second.
    pub fps: u32,

    /// Captured display width in pixels.
    pub width: u32,

    /// Captured display height in pixels.
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Target bitrate in megabits per second.
    pub bitrate_mbps: u32,

    /// Try the H.264 chain; false goes straight to JPEG.
    pub h264: bool,

    /// Quality for the JPEG fallback path (1-100).
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture and stream loopback audio.
    pub enabled: bool,

    /// Stream sample rate in Hz.
    pub sample_rate: u32,

    /// Stream channel count.
    pub channels: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture and encode queue depth. 3 favors latency; raise toward 120
    /// to absorb bursty networks at the cost of staleness.
    pub queue_depth: usize,

    /// Audio packet queue depth.
    pub audio_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 80,
            alt_port: 9000,
            max_clients: 4,
            capture: CaptureConfig::default(),
            encode: EncodeConfig::default(),
            audio: AudioConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            width: 1920,
            height: 1080,
        }
    }
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            bitrate_mbps: 8,
            h264: true,
            jpeg_quality: 70,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 3,
            audio_queue_depth: 200,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Target bitrate in bits per second.
    #[must_use]
    pub fn bitrate_bps(&self) -> u64 {
        u64::from(self.encode.bitrate_mbps) * 1_000_000
    }
}
