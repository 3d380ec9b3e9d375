//! The call surface a host binding drives: register callbacks, start, stop.

use std::sync::Arc;

use framecast_core::{BackendKind, CaptureConfig, CaptureError};
use tracing::info;

use crate::dispatcher::{DeliveredFrame, ErrorCallback, FrameCallback};
use crate::session::{CaptureSession, FailoverStrategy};

/// Owns at most one [`CaptureSession`] at a time.
#[derive(Default)]
pub struct CaptureService {
    strategy: FailoverStrategy,
    on_frame: Option<FrameCallback>,
    on_error: Option<ErrorCallback>,
    session: Option<CaptureSession>,
}

impl CaptureService {
    /// Service over the Windows capture backends.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(strategy: FailoverStrategy) -> Self {
        Self { strategy, on_frame: None, on_error: None, session: None }
    }

    /// Register the frame consumer, replacing any previous one. Takes effect
    /// at the next `start`.
    pub fn on_frame(&mut self, callback: impl Fn(DeliveredFrame) + Send + Sync + 'static) {
        self.on_frame = Some(Arc::new(callback));
    }

    /// Register the error consumer, replacing any previous one. Takes effect
    /// at the next `start`.
    pub fn on_error(&mut self, callback: impl Fn(String) + Send + Sync + 'static) {
        self.on_error = Some(Arc::new(callback));
    }

    /// Stop any running session, then start a new one. A request that fails
    /// validation leaves the running session untouched.
    pub fn start(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        let (Some(on_frame), Some(on_error)) = (self.on_frame.clone(), self.on_error.clone()) else {
            return Err(CaptureError::usage(
                "onFrame and onError callbacks must be registered before start",
            ));
        };
        config.validate()?;

        if self.session.is_some() {
            info!("[CaptureService] Restart requested; stopping the running session first");
            self.stop();
        }
        self.session = Some(CaptureSession::start(config, on_frame, on_error, &self.strategy)?);
        Ok(())
    }

    /// `start` from a JSON request such as
    /// `{"width":1920,"height":1080,"fps":30,"bitrateKbps":5000}`.
    pub fn start_json(&mut self, request: &str) -> Result<(), CaptureError> {
        self.start(CaptureConfig::from_json(request)?)
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.session.as_ref().is_some_and(CaptureSession::is_capturing)
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.session.as_ref().and_then(CaptureSession::active_backend)
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.stop();
    }
}
