//! Event-driven backend: the OS compositor calls us once per composited frame.
//!
//! There is no pacing code here; the compositor sets the frame rate and the
//! configured fps only reaches the encoder as metadata.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use framecast_core::{BackendKind, BackendState, CaptureConfig, CaptureError};
use tracing::{debug, info, warn};

use crate::{millis, CaptureBackend, FrameSink, MappedSurface, StateCell};

/// Callback handed to a compositor source. Invoked on an OS-owned thread.
pub type FrameArrived = Arc<dyn Fn(MappedSurface<'_>) + Send + Sync>;

/// An OS compositor that pushes frames.
pub trait CompositorSource: Send + 'static {
    /// Create the graphics device and the capture item.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Create the frame pool, register `on_frame` and start the OS session.
    fn start(&mut self, on_frame: FrameArrived) -> Result<(), CaptureError>;

    /// Close the OS session and release the device. Safe to call in any state.
    fn stop(&mut self);
}

pub struct EventBackend<C: CompositorSource> {
    source: C,
    config: Option<CaptureConfig>,
    state: Arc<StateCell>,
    /// Gates late callbacks that race with `stop`.
    live: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl<C: CompositorSource> EventBackend<C> {
    pub fn new(source: C) -> Self {
        Self {
            source,
            config: None,
            state: Arc::new(StateCell::default()),
            live: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<C: CompositorSource> CaptureBackend for EventBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::EventDriven
    }

    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if self.state.get() != BackendState::Uninitialized {
            return Err(CaptureError::usage("event-driven backend already initialized"));
        }
        if let Err(e) = self.source.open() {
            self.state.set(BackendState::Failed);
            return Err(e);
        }
        self.config = Some(config.clone());
        self.state.set(BackendState::Initialized);
        info!(
            "[EventBackend] Initialized: {}x{} @ {}fps (advisory), {}kbps",
            config.width, config.height, config.fps, config.bitrate_kbps
        );
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        let config = match (&self.config, self.state.get()) {
            (Some(config), BackendState::Initialized) => config.clone(),
            (_, state) => {
                return Err(CaptureError::usage(format!(
                    "event-driven backend cannot start from {state:?}"
                )))
            }
        };

        let started = Instant::now();
        let live = Arc::clone(&self.live);
        let frames = Arc::clone(&self.frames);
        let on_frame: FrameArrived = Arc::new(move |surface: MappedSurface<'_>| {
            if !live.load(Ordering::Acquire) {
                return;
            }
            let frame = surface.to_raw_frame(&config, millis(started.elapsed()));
            let n = frames.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 100 == 0 {
                debug!("[EventBackend] Frames captured: {}", n);
            }
            sink.on_frame(frame);
        });

        self.live.store(true, Ordering::Release);
        if let Err(e) = self.source.start(on_frame) {
            self.live.store(false, Ordering::Release);
            self.state.set(BackendState::Failed);
            warn!("[EventBackend] Start failed: {}", e);
            return Err(e);
        }

        self.state.set(BackendState::Capturing);
        info!("[EventBackend] Capture started");
        Ok(())
    }

    fn stop(&mut self) {
        self.live.store(false, Ordering::Release);
        self.source.stop();
        match self.state.get() {
            BackendState::Uninitialized | BackendState::Stopped | BackendState::Failed => {}
            BackendState::Initialized | BackendState::Capturing => {
                self.state.set(BackendState::Stopped);
                info!(
                    "[EventBackend] Stopped after {} frames",
                    self.frames.load(Ordering::Relaxed)
                );
            }
        }
    }

    fn state(&self) -> BackendState {
        self.state.get()
    }
}

impl<C: CompositorSource> Drop for EventBackend<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
