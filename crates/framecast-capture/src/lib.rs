//! framecast-capture: frame acquisition for the Framecast sender.
//!
//! Two backends share one capability interface ([`CaptureBackend`]):
//!
//! | Backend | Delivery | Windows source |
//! |---------|----------|----------------|
//! | [`EventBackend`] | OS pushes one callback per composited frame | Windows.Graphics.Capture |
//! | [`PollBackend`]  | dedicated thread polls with a bounded wait, paced to fps | DXGI Desktop Duplication |
//!
//! On non-Windows targets the OS sources are stubs whose `open` fails, so a
//! session there only runs on the [`synthetic`] sources.
//!
//! # Windows pipeline
//!
//! ```text
//! MonitorFromPoint(0,0, PRIMARY) → HMONITOR
//!   │  IGraphicsCaptureItemInterop::CreateForMonitor      IDXGIOutput1::DuplicateOutput
//!   ▼                                                      ▼
//! FrameArrived (thread-pool thread)              AcquireNextFrame(50ms) on poll thread
//!   │                                                      │
//!   └──────► staging texture → Map → RawFrame (BGRA) ◄─────┘
//!                              │
//!                              ▼
//!                     FrameSink::on_frame (same thread)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framecast_core::{BackendKind, BackendState, CaptureConfig, CaptureError, RawFrame};

mod event;
mod poll;
pub mod synthetic;

pub use event::{CompositorSource, EventBackend, FrameArrived};
pub use poll::{Acquire, DuplicationSurface, PollBackend, ACQUIRE_TIMEOUT, MAX_RECREATE_ATTEMPTS};

// ── Platform split ─────────────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
mod dxgi;
#[cfg(target_os = "windows")]
mod wgc;
#[cfg(target_os = "windows")]
use dxgi::DxgiDuplication as PlatformDuplication;
#[cfg(target_os = "windows")]
use wgc::WgcCompositor as PlatformCompositor;

#[cfg(not(target_os = "windows"))]
mod stub;
#[cfg(not(target_os = "windows"))]
use stub::{UnsupportedCompositor as PlatformCompositor, UnsupportedDuplication as PlatformDuplication};

/// Event-driven backend on the primary monitor.
pub fn event_driven_backend() -> Box<dyn CaptureBackend> {
    Box::new(EventBackend::new(PlatformCompositor::primary_monitor()))
}

/// Poll-driven backend on the primary output.
pub fn poll_driven_backend() -> Box<dyn CaptureBackend> {
    Box::new(PollBackend::new(PlatformDuplication::primary_output()))
}

// ── Contracts ─────────────────────────────────────────────────────────────────

/// Consumer of raw frames, called on the producer thread.
///
/// `on_frame` runs conversion and encoding synchronously, which is what paces
/// the producer. `on_fatal` is called at most once, when the backend gives up.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: RawFrame);
    fn on_fatal(&self, error: CaptureError);
}

/// Capability shared by both backend variants.
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Acquire the device and capture surface. Uninitialized → Initialized.
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Begin delivering frames to `sink`. Initialized → Capturing.
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<(), CaptureError>;

    /// Stop delivery, join any producer thread and release device handles.
    /// Idempotent; no frame reaches the sink once this returns.
    fn stop(&mut self);

    fn state(&self) -> BackendState;

    fn is_capturing(&self) -> bool {
        self.state() == BackendState::Capturing
    }
}

/// A mapped CPU view of a BGRA surface, valid only for the duration of a callback.
#[derive(Debug, Clone, Copy)]
pub struct MappedSurface<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub row_pitch: usize,
}

impl MappedSurface<'_> {
    /// Restrict the view to the top-left `width`×`height` region, capped at
    /// the surface size. Compositor content can be smaller than its surface.
    pub fn clipped(self, width: u32, height: u32) -> Self {
        Self { width: width.min(self.width), height: height.min(self.height), ..self }
    }

    /// Copy into a frame of the configured size.
    pub fn to_raw_frame(&self, config: &CaptureConfig, timestamp_ms: u64) -> RawFrame {
        RawFrame::from_surface(
            self.pixels,
            self.width,
            self.height,
            self.row_pitch,
            config.width,
            config.height,
            timestamp_ms,
        )
    }
}

/// Backend state shared between the owner and its producer thread.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: BackendState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> BackendState {
        BackendState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: BackendState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(BackendState::Uninitialized)
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipped_surface_keeps_top_left_content() {
        // 4×2 surface with an 8-byte pad per row; content is 2×1.
        let row_pitch = 4 * 4 + 8;
        let mut pixels = vec![0u8; row_pitch * 2];
        pixels[..8].copy_from_slice(&[1, 2, 3, 255, 4, 5, 6, 255]);
        pixels[8..16].fill(9);
        let surface = MappedSurface { pixels: &pixels, width: 4, height: 2, row_pitch };

        let content = surface.clipped(2, 1);
        assert_eq!((content.width, content.height, content.row_pitch), (2, 1, row_pitch));

        let frame = content.to_raw_frame(&CaptureConfig::new(2, 2, 30), 0);
        assert_eq!(&frame.data[..8], &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert!(frame.data[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn clipping_never_grows_the_surface() {
        let pixels = [0u8; 16];
        let surface = MappedSurface { pixels: &pixels, width: 2, height: 2, row_pitch: 8 };
        let clipped = surface.clipped(1920, 1080);
        assert_eq!((clipped.width, clipped.height), (2, 2));
    }
}
