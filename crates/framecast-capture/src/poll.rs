//! Poll-driven backend: a dedicated thread pulls frames from a duplication
//! surface with a bounded wait and sleeps to pace itself to the configured fps.
//!
//! ```text
//! loop while running
//!   acquire(50ms) ── Frame   → FrameSink::on_frame (convert + encode inline)
//!                 ├─ Timeout → nothing new, retry
//!                 ├─ Lost    → recreate surface in place (bounded attempts)
//!                 └─ other   → transient, retry
//!   sleep(frame_interval − elapsed)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use framecast_core::{BackendKind, BackendState, CaptureConfig, CaptureError};
use tracing::{debug, error, info, trace, warn};

use crate::{millis, CaptureBackend, FrameSink, MappedSurface, StateCell};

/// Upper bound on a single frame acquisition.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(50);

/// Consecutive recreation attempts after a device loss before the session fails.
pub const MAX_RECREATE_ATTEMPTS: u32 = 5;

const RECREATE_BACKOFF: Duration = Duration::from_millis(20);

/// Result of one acquisition attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// A frame was mapped and handed to the visitor.
    Frame,
    /// Nothing new within the timeout.
    Timeout,
}

/// A desktop duplication surface polled by [`PollBackend`].
pub trait DuplicationSurface: Send + 'static {
    /// Create the device and the duplication.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Wait up to `timeout` for a new frame. While it is mapped, `visit` is
    /// called exactly once. Returns [`CaptureError::DeviceLost`] when the
    /// duplication has become invalid and must be recreated.
    fn acquire(
        &mut self,
        timeout: Duration,
        visit: &mut dyn FnMut(MappedSurface<'_>),
    ) -> Result<Acquire, CaptureError>;

    /// Release and recreate the duplication after a device loss.
    fn recreate(&mut self) -> Result<(), CaptureError>;

    /// Release every device handle. Safe to call more than once.
    fn close(&mut self);
}

pub struct PollBackend<S: DuplicationSurface> {
    /// Moves into the poll thread while capturing and comes back on join.
    surface: Option<S>,
    config: Option<CaptureConfig>,
    state: Arc<StateCell>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<S>>,
}

impl<S: DuplicationSurface> PollBackend<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface: Some(surface),
            config: None,
            state: Arc::new(StateCell::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl<S: DuplicationSurface> CaptureBackend for PollBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::PollDriven
    }

    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if self.state.get() != BackendState::Uninitialized {
            return Err(CaptureError::usage("poll-driven backend already initialized"));
        }
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| CaptureError::usage("poll-driven backend has no surface"))?;
        if let Err(e) = surface.open() {
            surface.close();
            self.state.set(BackendState::Failed);
            return Err(e);
        }
        self.config = Some(config.clone());
        self.state.set(BackendState::Initialized);
        info!(
            "[PollBackend] Initialized: {}x{} @ {}fps, {}kbps",
            config.width, config.height, config.fps, config.bitrate_kbps
        );
        Ok(())
    }

    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError> {
        let config = match (&self.config, self.state.get()) {
            (Some(config), BackendState::Initialized) => config.clone(),
            (_, state) => {
                return Err(CaptureError::usage(format!(
                    "poll-driven backend cannot start from {state:?}"
                )))
            }
        };
        let surface = self
            .surface
            .take()
            .ok_or_else(|| CaptureError::usage("poll-driven backend has no surface"))?;

        self.running.store(true, Ordering::Release);
        self.state.set(BackendState::Capturing);

        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("framecast-poll".into())
            .spawn(move || poll_loop(surface, config, sink, running, state));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("[PollBackend] Capture started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.state.set(BackendState::Failed);
                Err(CaptureError::device_init(
                    BackendKind::PollDriven,
                    format!("spawn poll thread: {e}"),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(surface) => self.surface = Some(surface),
                Err(_) => error!("[PollBackend] Poll thread panicked"),
            }
        }
        if let Some(surface) = self.surface.as_mut() {
            surface.close();
        }

        match self.state.get() {
            BackendState::Initialized | BackendState::Capturing => {
                self.state.set(BackendState::Stopped);
                info!("[PollBackend] Stopped");
            }
            BackendState::Uninitialized | BackendState::Stopped | BackendState::Failed => {}
        }
    }

    fn state(&self) -> BackendState {
        self.state.get()
    }
}

impl<S: DuplicationSurface> Drop for PollBackend<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Poll thread ───────────────────────────────────────────────────────────────

fn poll_loop<S: DuplicationSurface>(
    mut surface: S,
    config: CaptureConfig,
    sink: Arc<dyn FrameSink>,
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
) -> S {
    let interval = config.frame_interval();
    let started = Instant::now();
    let mut frames: u64 = 0;

    while running.load(Ordering::Acquire) {
        let tick = Instant::now();

        let outcome = surface.acquire(ACQUIRE_TIMEOUT, &mut |mapped: MappedSurface<'_>| {
            let frame = mapped.to_raw_frame(&config, millis(started.elapsed()));
            sink.on_frame(frame);
        });

        match outcome {
            Ok(Acquire::Frame) => {
                frames += 1;
                if frames % 100 == 0 {
                    debug!("[PollBackend] Frames captured: {}", frames);
                }
            }
            Ok(Acquire::Timeout) => trace!("[PollBackend] No new frame within {:?}", ACQUIRE_TIMEOUT),
            Err(CaptureError::DeviceLost { reason }) => {
                warn!("[PollBackend] Duplication surface lost ({}), recreating", reason);
                if let Err(e) = recover(&mut surface, &running) {
                    error!("[PollBackend] {}", e);
                    state.set(BackendState::Failed);
                    running.store(false, Ordering::Release);
                    sink.on_fatal(e);
                    break;
                }
                continue;
            }
            Err(e) => trace!("[PollBackend] Transient acquisition failure: {}", e),
        }

        if let Some(rest) = interval.checked_sub(tick.elapsed()) {
            thread::sleep(rest);
        }
    }

    debug!("[PollBackend] Poll loop exited after {} frames", frames);
    surface
}

fn recover<S: DuplicationSurface>(surface: &mut S, running: &AtomicBool) -> Result<(), CaptureError> {
    let mut last_error = None;
    for attempt in 1..=MAX_RECREATE_ATTEMPTS {
        if !running.load(Ordering::Acquire) {
            return Ok(());
        }
        match surface.recreate() {
            Ok(()) => {
                info!("[PollBackend] Duplication surface recreated (attempt {})", attempt);
                return Ok(());
            }
            Err(e) => {
                warn!("[PollBackend] Recreate attempt {} failed: {}", attempt, e);
                last_error = Some(e);
                thread::sleep(RECREATE_BACKOFF);
            }
        }
    }
    let last = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(CaptureError::fatal(format!(
        "duplication surface lost and not recreated after {MAX_RECREATE_ATTEMPTS} attempts: {last}"
    )))
}
