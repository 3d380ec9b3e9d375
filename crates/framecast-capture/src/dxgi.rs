//! DXGI Desktop Duplication surface on the primary output.
//!
//! Available since Windows 8. Frames are pulled with `AcquireNextFrame`, copied
//! into a staging texture and mapped for the duration of the visitor call.

use std::time::Duration;

use anyhow::{Context, Result};
use framecast_core::{BackendKind, CaptureError};
use windows::{
    core::Interface,
    Win32::Graphics::{
        Direct3D11::{
            ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_MAPPED_SUBRESOURCE,
            D3D11_MAP_READ, D3D11_TEXTURE2D_DESC,
        },
        Dxgi::{
            IDXGIDevice, IDXGIOutput1, IDXGIOutputDuplication, IDXGIResource,
            DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_INVALID_CALL, DXGI_ERROR_WAIT_TIMEOUT,
            DXGI_OUTDUPL_FRAME_INFO,
        },
    },
};

use crate::wgc::{create_device, create_staging_texture};
use crate::{Acquire, DuplicationSurface, MappedSurface};

pub struct DxgiDuplication {
    device:      Option<ID3D11Device>,
    context:     Option<ID3D11DeviceContext>,
    duplication: Option<IDXGIOutputDuplication>,
    staging:     Option<(ID3D11Texture2D, u32, u32)>,
}

// SAFETY: the COM objects are only touched by whichever thread currently owns
// the surface; the poll backend moves it between threads, never shares it.
unsafe impl Send for DxgiDuplication {}

impl DxgiDuplication {
    pub fn primary_output() -> Self {
        Self { device: None, context: None, duplication: None, staging: None }
    }

    fn open_device(&mut self) -> Result<()> {
        let device = create_device()?;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe { device.GetImmediateContext(&mut context) };
        self.context = Some(context.context("GetImmediateContext")?);
        self.device = Some(device);
        Ok(())
    }

    fn duplicate(&mut self) -> Result<()> {
        let device = self.device.as_ref().context("device not open")?;
        let dxgi_device: IDXGIDevice = device.cast().context("cast IDXGIDevice")?;
        let adapter = unsafe { dxgi_device.GetAdapter().context("IDXGIDevice::GetAdapter")? };
        let output = unsafe { adapter.EnumOutputs(0).context("EnumOutputs(0)")? };
        let output1: IDXGIOutput1 = output.cast().context("cast IDXGIOutput1")?;
        let duplication =
            unsafe { output1.DuplicateOutput(device).context("DuplicateOutput")? };
        tracing::info!("[DxgiDuplication] Duplicating primary output");
        self.duplication = Some(duplication);
        Ok(())
    }

    fn release_duplication(&mut self) {
        self.duplication = None;
        self.staging = None;
    }
}

impl DuplicationSurface for DxgiDuplication {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.open_device()
            .and_then(|()| self.duplicate())
            .map_err(|e| {
                self.close();
                CaptureError::device_init(BackendKind::PollDriven, format!("{e:#}"))
            })
    }

    fn acquire(
        &mut self,
        timeout: Duration,
        visit: &mut dyn FnMut(MappedSurface<'_>),
    ) -> Result<Acquire, CaptureError> {
        let (Some(device), Some(context), Some(duplication)) =
            (self.device.clone(), self.context.clone(), self.duplication.clone())
        else {
            return Err(CaptureError::device_lost("duplication not open"));
        };

        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        if let Err(e) = unsafe { duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) } {
            return match e.code() {
                c if c == DXGI_ERROR_WAIT_TIMEOUT => Ok(Acquire::Timeout),
                c if c == DXGI_ERROR_ACCESS_LOST || c == DXGI_ERROR_INVALID_CALL => {
                    Err(CaptureError::device_lost(format!("AcquireNextFrame: {e}")))
                }
                _ => Err(CaptureError::transient(format!("AcquireNextFrame: {e}"))),
            };
        }

        let copied = (|| -> windows::core::Result<()> {
            let resource = resource.ok_or_else(|| {
                windows::core::Error::from(windows::Win32::Foundation::E_POINTER)
            })?;
            let texture: ID3D11Texture2D = resource.cast()?;
            let mut desc = D3D11_TEXTURE2D_DESC::default();
            unsafe { texture.GetDesc(&mut desc) };
            let (w, h) = (desc.Width, desc.Height);

            let reuse = matches!(&self.staging, Some((_, cw, ch)) if *cw == w && *ch == h);
            if !reuse {
                self.staging = Some((create_staging_texture(&device, w, h)?, w, h));
            }
            let Some((staging, _, _)) = self.staging.as_ref() else { return Ok(()) };

            unsafe { context.CopyResource(staging, &texture) };
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe { context.Map(staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))? };
            let row_pitch = mapped.RowPitch as usize;
            let pixels = unsafe {
                std::slice::from_raw_parts(mapped.pData as *const u8, row_pitch * h as usize)
            };
            visit(MappedSurface { pixels, width: w, height: h, row_pitch });
            unsafe { context.Unmap(staging, 0) };
            Ok(())
        })();

        let _ = unsafe { duplication.ReleaseFrame() };
        copied
            .map(|()| Acquire::Frame)
            .map_err(|e| CaptureError::transient(format!("copy duplicated frame: {e}")))
    }

    fn recreate(&mut self) -> Result<(), CaptureError> {
        self.release_duplication();
        let attempt = match self.duplicate() {
            Ok(()) => Ok(()),
            Err(first) => {
                // The device itself may be gone (mode change, GPU reset).
                tracing::debug!("[DxgiDuplication] Recreating device after: {:#}", first);
                self.device = None;
                self.context = None;
                self.open_device().and_then(|()| self.duplicate())
            }
        };
        attempt.map_err(|e| CaptureError::device_init(BackendKind::PollDriven, format!("{e:#}")))
    }

    fn close(&mut self) {
        self.release_duplication();
        self.context = None;
        self.device = None;
    }
}

impl Drop for DxgiDuplication {
    fn drop(&mut self) {
        self.close();
    }
}
