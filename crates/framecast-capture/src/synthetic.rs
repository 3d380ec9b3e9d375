//! Synthetic capture sources with scriptable failures.
//!
//! They stand in for the OS compositor and duplication surface on machines
//! without a Windows desktop (CI, headless demos) and let tests drive
//! initialization failures, start failures and device loss.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use framecast_core::{BackendKind, CaptureConfig, CaptureError};
use tracing::debug;

use crate::{
    Acquire, CaptureBackend, CompositorSource, DuplicationSurface, EventBackend, FrameArrived,
    MappedSurface, PollBackend,
};

/// Default cadence of the synthetic compositor, like a 60 Hz desktop.
pub const COMPOSITOR_RATE_HZ: u32 = 60;

/// Failure injection and observation, shared between a test and its sources.
#[derive(Debug, Default)]
pub struct SyntheticControl {
    fail_open: AtomicBool,
    fail_start: AtomicBool,
    stall: AtomicBool,
    lose_device: AtomicBool,
    recreate_failures: AtomicU32,
    opens: AtomicU32,
    recreations: AtomicU32,
    open_handles: AtomicUsize,
    frames: AtomicU64,
}

impl SyntheticControl {
    /// Make every `open` fail with a device initialization error.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make the compositor reject `start`.
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// While set, acquisitions wait out their timeout and return nothing.
    pub fn stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Invalidate the duplication on the next acquisition.
    pub fn lose_device(&self) {
        self.lose_device.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` recreation attempts.
    pub fn recreate_failures(&self, n: u32) {
        self.recreate_failures.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn recreations(&self) -> u32 {
        self.recreations.load(Ordering::SeqCst)
    }

    /// Devices currently open across all sources sharing this control.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    fn try_open(&self, backend: BackendKind) -> Result<(), CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::device_init(backend, "synthetic device unavailable"));
        }
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Event-driven backend over a [`SyntheticCompositor`] of the configured size.
pub fn event_driven_backend(config: &CaptureConfig, control: Arc<SyntheticControl>) -> Box<dyn CaptureBackend> {
    Box::new(EventBackend::new(SyntheticCompositor::new(
        config.width,
        config.height,
        COMPOSITOR_RATE_HZ,
        control,
    )))
}

/// Poll-driven backend over a [`SyntheticDuplication`] of the configured size.
pub fn poll_driven_backend(config: &CaptureConfig, control: Arc<SyntheticControl>) -> Box<dyn CaptureBackend> {
    Box::new(PollBackend::new(SyntheticDuplication::new(config.width, config.height, control)))
}

/// Moving gradient in BGRA, distinct for every frame number.
pub fn render_test_pattern(pixels: &mut [u8], width: u32, height: u32, frame_no: u64) {
    let shift = frame_no as usize;
    let stride = width as usize * 4;
    for (y, row) in pixels.chunks_exact_mut(stride).take(height as usize).enumerate() {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            px[0] = (x + shift) as u8;
            px[1] = (y + 2 * shift) as u8;
            px[2] = (x ^ y) as u8;
            px[3] = 255;
        }
    }
}

// ── SyntheticCompositor ───────────────────────────────────────────────────────

/// Pushes frames from its own thread, like a compositor thread pool.
pub struct SyntheticCompositor {
    width: u32,
    height: u32,
    rate_hz: u32,
    control: Arc<SyntheticControl>,
    open: bool,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticCompositor {
    pub fn new(width: u32, height: u32, rate_hz: u32, control: Arc<SyntheticControl>) -> Self {
        Self {
            width,
            height,
            rate_hz: rate_hz.max(1),
            control,
            open: false,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CompositorSource for SyntheticCompositor {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.control.try_open(BackendKind::EventDriven)?;
        self.open = true;
        Ok(())
    }

    fn start(&mut self, on_frame: FrameArrived) -> Result<(), CaptureError> {
        if !self.open {
            return Err(CaptureError::device_init(BackendKind::EventDriven, "compositor not open"));
        }
        if self.control.fail_start.load(Ordering::SeqCst) {
            return Err(CaptureError::device_init(
                BackendKind::EventDriven,
                "StartCapture rejected by synthetic compositor",
            ));
        }

        let (width, height) = (self.width, self.height);
        let period = Duration::from_secs_f64(1.0 / self.rate_hz as f64);
        let control = Arc::clone(&self.control);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("synthetic-compositor".into())
            .spawn(move || {
                let mut pixels = vec![0u8; width as usize * height as usize * 4];
                let mut frame_no = 0u64;
                while running.load(Ordering::SeqCst) {
                    render_test_pattern(&mut pixels, width, height, frame_no);
                    control.frames.fetch_add(1, Ordering::SeqCst);
                    on_frame(MappedSurface {
                        pixels: &pixels,
                        width,
                        height,
                        row_pitch: width as usize * 4,
                    });
                    frame_no += 1;
                    thread::sleep(period);
                }
                debug!("synthetic compositor exited after {} frames", frame_no);
            })
            .map_err(|e| CaptureError::device_init(BackendKind::EventDriven, e.to_string()))?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if self.open {
            self.open = false;
            self.control.release();
        }
    }
}

impl Drop for SyntheticCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── SyntheticDuplication ──────────────────────────────────────────────────────

/// Always has a fresh frame ready unless stalled or lost.
pub struct SyntheticDuplication {
    width: u32,
    height: u32,
    control: Arc<SyntheticControl>,
    open: bool,
    lost: bool,
    frame_no: u64,
    pixels: Vec<u8>,
}

impl SyntheticDuplication {
    pub fn new(width: u32, height: u32, control: Arc<SyntheticControl>) -> Self {
        Self {
            width,
            height,
            control,
            open: false,
            lost: false,
            frame_no: 0,
            pixels: vec![0u8; width as usize * height as usize * 4],
        }
    }
}

impl DuplicationSurface for SyntheticDuplication {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.control.try_open(BackendKind::PollDriven)?;
        self.open = true;
        self.lost = false;
        Ok(())
    }

    fn acquire(
        &mut self,
        timeout: Duration,
        visit: &mut dyn FnMut(MappedSurface<'_>),
    ) -> Result<Acquire, CaptureError> {
        if !self.open {
            return Err(CaptureError::device_lost("duplication not open"));
        }
        if self.control.lose_device.swap(false, Ordering::SeqCst) {
            self.lost = true;
        }
        if self.lost {
            return Err(CaptureError::device_lost("DXGI_ERROR_ACCESS_LOST (synthetic)"));
        }
        if self.control.stall.load(Ordering::SeqCst) {
            thread::sleep(timeout);
            return Ok(Acquire::Timeout);
        }

        render_test_pattern(&mut self.pixels, self.width, self.height, self.frame_no);
        self.frame_no += 1;
        self.control.frames.fetch_add(1, Ordering::SeqCst);
        visit(MappedSurface {
            pixels: &self.pixels,
            width: self.width,
            height: self.height,
            row_pitch: self.width as usize * 4,
        });
        Ok(Acquire::Frame)
    }

    fn recreate(&mut self) -> Result<(), CaptureError> {
        self.control.recreations.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .control
            .recreate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CaptureError::device_init(
                BackendKind::PollDriven,
                "DuplicateOutput failed (synthetic)",
            ));
        }
        if !self.open {
            self.control.try_open(BackendKind::PollDriven)?;
            self.open = true;
        }
        self.lost = false;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.control.release();
        }
    }
}

impl Drop for SyntheticDuplication {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_changes_between_frames() {
        let mut a = vec![0u8; 8 * 4 * 4];
        let mut b = a.clone();
        render_test_pattern(&mut a, 8, 4, 0);
        render_test_pattern(&mut b, 8, 4, 1);
        assert_ne!(a, b);
        assert!(a.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn duplication_tracks_handles_and_loss() {
        let control = Arc::new(SyntheticControl::default());
        let mut dup = SyntheticDuplication::new(4, 4, Arc::clone(&control));
        dup.open().unwrap();
        assert_eq!(control.open_handles(), 1);

        let mut seen = 0;
        let got = dup.acquire(Duration::from_millis(1), &mut |_s: MappedSurface<'_>| seen += 1).unwrap();
        assert_eq!(got, Acquire::Frame);
        assert_eq!(seen, 1);

        control.lose_device();
        let err = dup.acquire(Duration::from_millis(1), &mut |_s: MappedSurface<'_>| {}).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceLost { .. }));
        // Stays lost until recreated.
        assert!(dup.acquire(Duration::from_millis(1), &mut |_s: MappedSurface<'_>| {}).is_err());
        dup.recreate().unwrap();
        assert!(dup.acquire(Duration::from_millis(1), &mut |_s: MappedSurface<'_>| {}).is_ok());

        drop(dup);
        assert_eq!(control.open_handles(), 0);
    }
}
