use thiserror::Error;

use crate::types::BackendKind;

/// Every failure the capture pipeline can report.
///
/// Configuration and initialization errors are returned synchronously from
/// `start`; everything after a successful start travels through the error
/// channel of the frame dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Configuration invalid: {reason}")]
    Configuration { reason: String },

    #[error("Usage error: {reason}")]
    Usage { reason: String },

    #[error("{backend} device initialization failed: {reason}")]
    DeviceInitialization { backend: BackendKind, reason: String },

    #[error("Encoder initialization failed: {reason}")]
    EncoderInitialization { reason: String },

    #[error("Frame acquisition failed: {reason}")]
    TransientCapture { reason: String },

    #[error("Capture surface lost: {reason}")]
    DeviceLost { reason: String },

    #[error("Frame encode failed: {reason}")]
    Encode { reason: String },

    #[error("Capture session failed: {reason}")]
    FatalSession { reason: String },
}

impl CaptureError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage { reason: reason.into() }
    }

    pub fn device_init(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::DeviceInitialization { backend, reason: reason.into() }
    }

    pub fn encoder_init(reason: impl Into<String>) -> Self {
        Self::EncoderInitialization { reason: reason.into() }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientCapture { reason: reason.into() }
    }

    pub fn device_lost(reason: impl Into<String>) -> Self {
        Self::DeviceLost { reason: reason.into() }
    }

    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode { reason: reason.into() }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalSession { reason: reason.into() }
    }

    /// Whether the session may try the next backend after this error.
    ///
    /// Only initialization failures qualify, and only during `start`.
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            Self::DeviceInitialization { .. } | Self::EncoderInitialization { .. }
        )
    }

    /// Transient errors are retried silently by the capture loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCapture { .. } | Self::Encode { .. })
    }
}
