//! Windows.Graphics.Capture (WGC) compositor source.
//!
//! Requires Windows 10 1803+ (build 17134) and the `windows` crate with WGC features.
//!
//! # Threading model
//!
//! The frame pool is created free-threaded, so `FrameArrived` runs on a
//! thread-pool thread. The callback copies the frame through a staging
//! texture and hands the mapped pixels to the backend while still mapped.

use anyhow::{Context, Result};
use framecast_core::{BackendKind, CaptureError};
use windows::{
    core::Interface,
    Foundation::TypedEventHandler,
    Graphics::{
        Capture::{Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession},
        DirectX::{Direct3D11::IDirect3DDevice, DirectXPixelFormat},
        SizeInt32,
    },
    Win32::{
        Foundation::{HMODULE, POINT},
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::{
                D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
                D3D11_BIND_FLAG, D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_RESOURCE_MISC_FLAG,
                D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC},
                IDXGIDevice,
            },
            Gdi::{MonitorFromPoint, MONITOR_DEFAULTTOPRIMARY},
        },
        System::WinRT::{
            Direct3D11::{CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess},
            Graphics::Capture::IGraphicsCaptureItemInterop,
            RoInitialize, RO_INIT_MULTITHREADED,
        },
    },
};

use crate::{CompositorSource, FrameArrived, MappedSurface};

// ── WgcCompositor ─────────────────────────────────────────────────────────────

pub struct WgcCompositor {
    device:       Option<ID3D11Device>,
    winrt_device: Option<IDirect3DDevice>,
    item:         Option<GraphicsCaptureItem>,
    pool:         Option<Direct3D11CaptureFramePool>,
    session:      Option<GraphicsCaptureSession>,
}

// SAFETY: D3D11 devices are free-threaded and the WinRT capture objects are
// agile; the compositor is only moved between threads, never shared.
unsafe impl Send for WgcCompositor {}

impl WgcCompositor {
    pub fn primary_monitor() -> Self {
        Self { device: None, winrt_device: None, item: None, pool: None, session: None }
    }

    fn open_inner(&mut self) -> Result<()> {
        // Initialise WinRT on this thread (no-op if already done)
        unsafe { let _ = RoInitialize(RO_INIT_MULTITHREADED); }

        let device = create_device()?;
        let dxgi_device: IDXGIDevice = device.cast().context("cast IDXGIDevice")?;
        let winrt_device: IDirect3DDevice = unsafe {
            CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)
                .context("CreateDirect3D11DeviceFromDXGIDevice")?
        }
        .cast()
        .context("cast IDirect3DDevice")?;

        let hmonitor = unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };
        let interop: IGraphicsCaptureItemInterop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("IGraphicsCaptureItemInterop factory")?;
        let item: GraphicsCaptureItem =
            unsafe { interop.CreateForMonitor(hmonitor).context("CreateForMonitor")? };
        let size = item.Size().context("GraphicsCaptureItem::Size")?;
        tracing::info!(
            "[WgcCompositor] Primary monitor {:?} item size {}x{}",
            hmonitor, size.Width, size.Height
        );

        self.device = Some(device);
        self.winrt_device = Some(winrt_device);
        self.item = Some(item);
        Ok(())
    }

    fn start_inner(&mut self, on_frame: FrameArrived) -> Result<()> {
        let (device, winrt_device, item) = match (&self.device, &self.winrt_device, &self.item) {
            (Some(d), Some(w), Some(i)) => (d.clone(), w.clone(), i.clone()),
            _ => anyhow::bail!("compositor not open"),
        };
        let size: SizeInt32 = item.Size().context("GraphicsCaptureItem::Size")?;

        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            &winrt_device,
            DirectXPixelFormat::B8G8R8A8UIntNormalized,
            2, // buffer count
            size,
        )
        .context("CreateFreeThreaded frame pool")?;

        let session = pool.CreateCaptureSession(&item).context("CreateCaptureSession")?;
        // Disable the yellow capture border (Windows 11 22H2+; OK to ignore error)
        let _ = session.SetIsBorderRequired(false);

        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe { device.GetImmediateContext(&mut context) };
        let context = context.context("GetImmediateContext")?;
        // Reused until the pool surface size changes.
        let mut staging: Option<(ID3D11Texture2D, u32, u32)> = None;

        pool.FrameArrived(&TypedEventHandler::new(
            move |pool_ref: &Option<Direct3D11CaptureFramePool>, _| {
                let Some(pool_ref) = pool_ref else { return Ok(()) };
                let Ok(frame) = pool_ref.TryGetNextFrame() else { return Ok(()) };

                let access: IDirect3DDxgiInterfaceAccess = frame.Surface()?.cast()?;
                let texture: ID3D11Texture2D = unsafe { access.GetInterface()? };
                // CopyResource needs identical sizes: the staging texture follows
                // the pool surface, the content may be smaller after a resize.
                let mut desc = D3D11_TEXTURE2D_DESC::default();
                unsafe { texture.GetDesc(&mut desc) };
                let (tw, th) = (desc.Width, desc.Height);
                let content = frame.ContentSize()?;

                let reuse = matches!(&staging, Some((_, cw, ch)) if *cw == tw && *ch == th);
                if !reuse {
                    staging = Some((create_staging_texture(&device, tw, th)?, tw, th));
                }
                let Some((staging_tex, _, _)) = staging.as_ref() else { return Ok(()) };

                unsafe { context.CopyResource(staging_tex, &texture) };
                let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
                unsafe { context.Map(staging_tex, 0, D3D11_MAP_READ, 0, Some(&mut mapped))? };

                let row_pitch = mapped.RowPitch as usize;
                let pixels = unsafe {
                    std::slice::from_raw_parts(mapped.pData as *const u8, row_pitch * th as usize)
                };
                let surface = MappedSurface { pixels, width: tw, height: th, row_pitch };
                on_frame(surface.clipped(content.Width.max(0) as u32, content.Height.max(0) as u32));

                unsafe { context.Unmap(staging_tex, 0) };
                Ok(())
            },
        ))
        .context("FrameArrived handler")?;

        session.StartCapture().context("StartCapture")?;
        self.pool = Some(pool);
        self.session = Some(session);
        Ok(())
    }
}

impl CompositorSource for WgcCompositor {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.open_inner().map_err(|e| {
            self.stop();
            CaptureError::device_init(BackendKind::EventDriven, format!("{e:#}"))
        })
    }

    fn start(&mut self, on_frame: FrameArrived) -> Result<(), CaptureError> {
        self.start_inner(on_frame)
            .map_err(|e| CaptureError::device_init(BackendKind::EventDriven, format!("{e:#}")))
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(pool) = self.pool.take() {
            let _ = pool.Close();
        }
        self.item = None;
        self.winrt_device = None;
        self.device = None;
    }
}

impl Drop for WgcCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub(crate) fn create_device() -> Result<ID3D11Device> {
    let mut device: Option<ID3D11Device> = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            None,
        )
        .context("D3D11CreateDevice")?;
    }
    device.context("D3D11CreateDevice returned no device")
}

/// Create a CPU-readable staging texture matching (w×h, BGRA8).
pub(crate) fn create_staging_texture(
    device: &ID3D11Device,
    w: u32,
    h: u32,
) -> windows::core::Result<ID3D11Texture2D> {
    let desc = D3D11_TEXTURE2D_DESC {
        Width:     w,
        Height:    h,
        MipLevels: 1,
        ArraySize: 1,
        Format:    DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage:     D3D11_USAGE_STAGING,
        BindFlags: D3D11_BIND_FLAG(0).0 as u32,
        CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
        MiscFlags: D3D11_RESOURCE_MISC_FLAG(0).0 as u32,
    };
    let mut tex: Option<ID3D11Texture2D> = None;
    unsafe { device.CreateTexture2D(&desc, None, Some(&mut tex))? };
    tex.ok_or_else(|| windows::core::Error::from(windows::Win32::Foundation::E_POINTER))
}
