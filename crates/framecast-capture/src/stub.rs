//! Non-Windows stubs for the OS capture sources (CI + cross-compilation).
//!
//! Both fail in `open`, so a session on these platforms reports that neither
//! backend is available instead of producing nothing.

use std::time::Duration;

use framecast_core::{BackendKind, CaptureError};

use crate::{Acquire, CompositorSource, DuplicationSurface, FrameArrived, MappedSurface};

pub struct UnsupportedCompositor;

impl UnsupportedCompositor {
    pub fn primary_monitor() -> Self {
        Self
    }
}

impl CompositorSource for UnsupportedCompositor {
    fn open(&mut self) -> Result<(), CaptureError> {
        tracing::warn!("Windows.Graphics.Capture requested on a non-Windows platform");
        Err(CaptureError::device_init(
            BackendKind::EventDriven,
            "Windows.Graphics.Capture is only available on Windows 10 1803+",
        ))
    }

    fn start(&mut self, _on_frame: FrameArrived) -> Result<(), CaptureError> {
        Err(CaptureError::device_init(BackendKind::EventDriven, "compositor not open"))
    }

    fn stop(&mut self) {}
}

pub struct UnsupportedDuplication;

impl UnsupportedDuplication {
    pub fn primary_output() -> Self {
        Self
    }
}

impl DuplicationSurface for UnsupportedDuplication {
    fn open(&mut self) -> Result<(), CaptureError> {
        tracing::warn!("DXGI Desktop Duplication requested on a non-Windows platform");
        Err(CaptureError::device_init(
            BackendKind::PollDriven,
            "DXGI Desktop Duplication is only available on Windows 8+",
        ))
    }

    fn acquire(
        &mut self,
        _timeout: Duration,
        _visit: &mut dyn FnMut(MappedSurface<'_>),
    ) -> Result<Acquire, CaptureError> {
        Err(CaptureError::device_lost("duplication not open"))
    }

    fn recreate(&mut self) -> Result<(), CaptureError> {
        self.open()
    }

    fn close(&mut self) {}
}
