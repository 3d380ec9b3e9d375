//! `CaptureSession`: one start-to-stop run of capture → convert → encode → dispatch.
//!
//! # Start
//!
//! ```text
//! validate config
//! spawn dispatcher
//! for backend in [primary (event-driven), fallback (poll-driven)]:
//!     initialize → create encoder → start        ── ok  → Capturing
//!     any step fails → stop backend, next          (at most one failover)
//! both failed → FatalSession (returned and sent once on the error channel)
//! ```
//!
//! # Stop
//!
//! backend stop (joins the producer) → encoder flush → backend released →
//! dispatcher drained and joined.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use framecast_capture::synthetic::{self, SyntheticControl};
use framecast_capture::{CaptureBackend, FrameSink};
use framecast_core::{BackendKind, BackendState, CaptureConfig, CaptureError, PlanarFrame, RawFrame};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::convert::convert_into;
use crate::dispatcher::{DispatchHandle, ErrorCallback, FrameCallback, FrameDispatcher};
use crate::encoder::FrameEncoder;

// ── FailoverStrategy ──────────────────────────────────────────────────────────

pub type BackendFactory = Arc<dyn Fn(&CaptureConfig) -> Box<dyn CaptureBackend> + Send + Sync>;

/// Which backend to try first and which one to fall back to.
#[derive(Clone)]
pub struct FailoverStrategy {
    primary: BackendFactory,
    fallback: BackendFactory,
}

impl FailoverStrategy {
    pub fn new(primary: BackendFactory, fallback: BackendFactory) -> Self {
        Self { primary, fallback }
    }

    /// Windows.Graphics.Capture first, DXGI Desktop Duplication second.
    pub fn platform() -> Self {
        Self::new(
            Arc::new(|_: &CaptureConfig| framecast_capture::event_driven_backend()),
            Arc::new(|_: &CaptureConfig| framecast_capture::poll_driven_backend()),
        )
    }

    /// The same order over synthetic sources sharing `control`.
    pub fn synthetic(control: Arc<SyntheticControl>) -> Self {
        let fallback_control = Arc::clone(&control);
        Self::new(
            Arc::new(move |config: &CaptureConfig| {
                synthetic::event_driven_backend(config, Arc::clone(&control))
            }),
            Arc::new(move |config: &CaptureConfig| {
                synthetic::poll_driven_backend(config, Arc::clone(&fallback_control))
            }),
        )
    }

    fn candidates(&self) -> [&BackendFactory; 2] {
        [&self.primary, &self.fallback]
    }
}

impl Default for FailoverStrategy {
    fn default() -> Self {
        Self::platform()
    }
}

// ── FramePipeline ─────────────────────────────────────────────────────────────

/// The producer-side work for each raw frame: convert, encode, hand off.
struct FramePipeline {
    inner: Mutex<PipelineInner>,
    fatal_reported: AtomicBool,
    encode_failures: AtomicU64,
}

struct PipelineInner {
    encoder: Option<FrameEncoder>,
    planar: PlanarFrame,
    dispatch: Option<DispatchHandle>,
}

impl FramePipeline {
    fn new(encoder: FrameEncoder, dispatch: DispatchHandle, config: &CaptureConfig) -> Self {
        Self {
            inner: Mutex::new(PipelineInner {
                encoder: Some(encoder),
                planar: PlanarFrame::new(config.width, config.height),
                dispatch: Some(dispatch),
            }),
            fatal_reported: AtomicBool::new(false),
            encode_failures: AtomicU64::new(0),
        }
    }

    /// Flush the encoder, deliver what it drained and let go of the dispatch
    /// handle. Later frames are ignored.
    fn finish(&self) {
        let mut inner = self.inner.lock();
        let dispatch = inner.dispatch.take();
        let Some(encoder) = inner.encoder.take() else { return };
        match encoder.flush_and_close() {
            Ok(units) => {
                if let Some(dispatch) = &dispatch {
                    units.iter().for_each(|au| dispatch.send_frame(au));
                }
            }
            Err(e) => warn!("[CaptureSession] Encoder flush failed: {}", e),
        }
    }
}

impl FrameSink for FramePipeline {
    fn on_frame(&self, frame: RawFrame) {
        let mut inner = self.inner.lock();
        let PipelineInner { encoder, planar, dispatch } = &mut *inner;
        let (Some(encoder), Some(dispatch)) = (encoder.as_mut(), dispatch.as_ref()) else {
            return;
        };

        convert_into(&frame, planar);
        match encoder.encode(planar, frame.timestamp_ms) {
            Ok(units) => units.iter().for_each(|au| dispatch.send_frame(au)),
            Err(e) => {
                let n = self.encode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % 100 == 0 {
                    warn!("[CaptureSession] Frame at {}ms not encoded ({} failures): {}", frame.timestamp_ms, n, e);
                }
            }
        }
    }

    fn on_fatal(&self, error: CaptureError) {
        if self.fatal_reported.swap(true, Ordering::AcqRel) {
            debug!("[CaptureSession] Further fatal error suppressed: {}", error);
            return;
        }
        error!("[CaptureSession] {}", error);
        if let Some(dispatch) = self.inner.lock().dispatch.as_ref() {
            dispatch.send_error(&error);
        }
    }
}

// ── CaptureSession ────────────────────────────────────────────────────────────

pub struct CaptureSession {
    config: CaptureConfig,
    backend: Option<Box<dyn CaptureBackend>>,
    pipeline: Arc<FramePipeline>,
    dispatcher: Option<FrameDispatcher>,
}

impl CaptureSession {
    /// Bring up a backend (failing over once) and start capturing.
    ///
    /// On error nothing is left running: every backend tried has been stopped
    /// and the dispatcher has been shut down.
    pub fn start(
        config: CaptureConfig,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
        strategy: &FailoverStrategy,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        let dispatcher = FrameDispatcher::spawn(config.width, config.height, on_frame, on_error)?;

        let mut failures = Vec::new();
        for factory in strategy.candidates() {
            let mut backend = factory(&config);
            let kind = backend.kind();
            match bring_up(backend.as_mut(), &config, &dispatcher) {
                Ok(pipeline) => {
                    info!(
                        "[CaptureSession] Capturing with {} backend: {}x{} @ {}fps, {}kbps",
                        kind, config.width, config.height, config.fps, config.bitrate_kbps
                    );
                    return Ok(Self {
                        config,
                        backend: Some(backend),
                        pipeline,
                        dispatcher: Some(dispatcher),
                    });
                }
                Err(e) => {
                    backend.stop();
                    if !e.allows_failover() {
                        dispatcher.shutdown();
                        return Err(e);
                    }
                    warn!("[CaptureSession] {} backend unavailable: {}", kind, e);
                    failures.push(e.to_string());
                }
            }
        }

        let error = CaptureError::fatal(format!("no capture backend could start: {}", failures.join("; ")));
        error!("[CaptureSession] {}", error);
        dispatcher.handle().send_error(&error);
        dispatcher.shutdown();
        Err(error)
    }

    /// Stop capturing and release everything. Idempotent.
    pub fn stop(&mut self) {
        let Some(mut backend) = self.backend.take() else { return };
        let kind = backend.kind();

        backend.stop();
        self.pipeline.finish();
        drop(backend);
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        info!(
            "[CaptureSession] Stopped ({} backend, {}x{} @ {}fps)",
            kind, self.config.width, self.config.height, self.config.fps
        );
    }

    pub fn is_capturing(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.is_capturing())
    }

    /// Backend state, or `Stopped` once the session has been stopped.
    pub fn state(&self) -> BackendState {
        self.backend.as_ref().map_or(BackendState::Stopped, |b| b.state())
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bring_up(
    backend: &mut dyn CaptureBackend,
    config: &CaptureConfig,
    dispatcher: &FrameDispatcher,
) -> Result<Arc<FramePipeline>, CaptureError> {
    backend.initialize(config)?;
    let encoder = FrameEncoder::initialize(config)?;
    let pipeline = Arc::new(FramePipeline::new(encoder, dispatcher.handle(), config));
    if let Err(e) = backend.start(Arc::clone(&pipeline) as Arc<dyn FrameSink>) {
        pipeline.finish();
        return Err(e);
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::DeliveredFrame;

    fn config() -> CaptureConfig {
        let mut config = CaptureConfig::new(32, 32, 30);
        config.use_hardware_encoder = false;
        config
    }

    fn callbacks() -> (FrameCallback, ErrorCallback, Arc<AtomicU64>, Arc<Mutex<Vec<String>>>) {
        let frames = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (f, e) = (Arc::clone(&frames), Arc::clone(&errors));
        (
            Arc::new(move |_: DeliveredFrame| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |m: String| e.lock().push(m)),
            frames,
            errors,
        )
    }

    #[test]
    fn prefers_event_driven_backend() {
        let control = Arc::new(SyntheticControl::default());
        let (on_frame, on_error, frames, _) = callbacks();
        let mut session =
            CaptureSession::start(config(), on_frame, on_error, &FailoverStrategy::synthetic(control)).unwrap();
        assert_eq!(session.active_backend(), Some(BackendKind::EventDriven));
        assert!(session.is_capturing());
        std::thread::sleep(Duration::from_millis(150));
        session.stop();
        assert!(frames.load(Ordering::SeqCst) > 0);
        assert_eq!(session.state(), BackendState::Stopped);
    }

    #[test]
    fn invalid_config_acquires_nothing() {
        let control = Arc::new(SyntheticControl::default());
        let (on_frame, on_error, _, errors) = callbacks();
        let err = CaptureSession::start(
            CaptureConfig::new(33, 32, 30),
            on_frame,
            on_error,
            &FailoverStrategy::synthetic(Arc::clone(&control)),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CaptureError::Configuration { .. }));
        assert_eq!(control.opens(), 0);
        assert!(errors.lock().is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let control = Arc::new(SyntheticControl::default());
        let (on_frame, on_error, _, _) = callbacks();
        let mut session = CaptureSession::start(
            config(),
            on_frame,
            on_error,
            &FailoverStrategy::synthetic(Arc::clone(&control)),
        )
        .unwrap();
        session.stop();
        session.stop();
        assert!(!session.is_capturing());
        assert_eq!(session.active_backend(), None);
        assert_eq!(control.open_handles(), 0);
    }
}
