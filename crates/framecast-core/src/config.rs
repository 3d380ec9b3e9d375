use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;

pub const DEFAULT_BITRATE_KBPS: u32 = 5000;

fn default_bitrate_kbps() -> u32 {
    DEFAULT_BITRATE_KBPS
}

fn default_use_hardware_encoder() -> bool {
    true
}

/// Parameters of one capture session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default = "default_bitrate_kbps", alias = "bitrate", alias = "bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_use_hardware_encoder", alias = "use_hardware_encoder")]
    pub use_hardware_encoder: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            use_hardware_encoder: true,
        }
    }
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps, ..Default::default() }
    }

    /// Parse a host start request. Missing required fields are configuration errors.
    pub fn from_json(json: &str) -> Result<Self, CaptureError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CaptureError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        for (name, value) in [
            ("width", self.width),
            ("height", self.height),
            ("fps", self.fps),
            ("bitrateKbps", self.bitrate_kbps),
        ] {
            if value == 0 {
                return Err(CaptureError::configuration(format!("{name} must be greater than 0")));
            }
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CaptureError::configuration(format!(
                "dimensions must be even for 4:2:0 chroma subsampling, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Pacing period of the poll-driven backend.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.fps.max(1) as u64)
    }

    /// Rate-control ceiling: 1.5× the target bitrate.
    pub fn peak_bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps.saturating_mul(3) / 2
    }

    /// Rate-control buffer, sized to one second of the target bitrate.
    pub fn vbv_buffer_kbits(&self) -> u32 {
        self.bitrate_kbps
    }
}
