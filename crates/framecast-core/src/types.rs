use bytes::{Bytes, BytesMut};

use crate::nal;

// ── BackendKind ───────────────────────────────────────────────────────────────

/// The two frame-acquisition strategies, in failover order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// OS-pushed frames (Windows.Graphics.Capture `FrameArrived`).
    EventDriven,
    /// Dedicated thread polling a duplication surface (DXGI Desktop Duplication).
    PollDriven,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventDriven => write!(f, "event-driven (WGC)"),
            Self::PollDriven => write!(f, "poll-driven (DXGI)"),
        }
    }
}

// ── BackendState ──────────────────────────────────────────────────────────────

/// Lifecycle of one capture backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    Uninitialized = 0,
    Initialized = 1,
    Capturing = 2,
    Stopped = 3,
    Failed = 4,
}

impl BackendState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Capturing,
            3 => Self::Stopped,
            4 => Self::Failed,
            _ => Self::Uninitialized,
        }
    }
}

// ── RawFrame ──────────────────────────────────────────────────────────────────

/// A captured frame, 4 bytes per pixel in B, G, R, A order, tightly packed.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Milliseconds since the capture session started.
    pub timestamp_ms: u64,
}

impl RawFrame {
    /// Copy a mapped surface into a frame of exactly `width`×`height`.
    ///
    /// `row_pitch` is the byte stride of `pixels`. The surface is cropped to the
    /// target size, and zero-padded where it is smaller.
    pub fn from_surface(
        pixels: &[u8],
        surface_width: u32,
        surface_height: u32,
        row_pitch: usize,
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Self {
        let dst_stride = width as usize * 4;
        let mut data = vec![0u8; dst_stride * height as usize];

        let copy_rows = surface_height.min(height) as usize;
        let copy_bytes = (surface_width.min(width) as usize * 4).min(row_pitch);
        for row in 0..copy_rows {
            let src_start = row * row_pitch;
            let Some(src) = pixels.get(src_start..src_start + copy_bytes) else {
                break;
            };
            let dst_start = row * dst_stride;
            data[dst_start..dst_start + copy_bytes].copy_from_slice(src);
        }

        Self { data, width, height, timestamp_ms }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height)
    }
}

// ── PlanarFrame ───────────────────────────────────────────────────────────────

/// I420: full-resolution luma plus two quarter-size chroma planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarFrame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl PlanarFrame {
    /// Allocate zeroed planes. Width and height must be even.
    pub fn new(width: u32, height: u32) -> Self {
        let luma = width as usize * height as usize;
        let chroma = (width as usize / 2) * (height as usize / 2);
        Self {
            width,
            height,
            y: vec![0; luma],
            u: vec![0; chroma],
            v: vec![0; chroma],
        }
    }

    pub fn chroma_width(&self) -> u32 {
        self.width / 2
    }

    pub fn chroma_height(&self) -> u32 {
        self.height / 2
    }
}

// ── EncodedAccessUnit ─────────────────────────────────────────────────────────

/// One encoder output: start-code-delimited NAL units in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAccessUnit {
    /// Each unit keeps its Annex B start code.
    pub units: Vec<Bytes>,
    pub timestamp_ms: u64,
    pub is_keyframe: bool,
}

impl EncodedAccessUnit {
    /// Split an Annex B bitstream into units and classify it.
    pub fn from_annexb(bitstream: &[u8], timestamp_ms: u64) -> Self {
        let units: Vec<Bytes> = nal::split_annexb(bitstream)
            .into_iter()
            .map(Bytes::copy_from_slice)
            .collect();
        let is_keyframe = units.iter().any(|u| nal::unit_type(u) == Some(nal::NAL_IDR));
        Self { units, timestamp_ms, is_keyframe }
    }

    /// Concatenation of all units, ready for a byte-stream consumer.
    pub fn to_annexb(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for unit in &self.units {
            out.extend_from_slice(unit);
        }
        out.freeze()
    }

    pub fn len(&self) -> usize {
        self.units.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit_types(&self) -> Vec<u8> {
        self.units.iter().filter_map(|u| nal::unit_type(u)).collect()
    }

    pub fn contains_parameter_sets(&self) -> bool {
        let types = self.unit_types();
        types.contains(&nal::NAL_SPS) && types.contains(&nal::NAL_PPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_surface_honours_row_pitch_and_crops() {
        // 3×2 surface with 16-byte rows (4 bytes of padding per row).
        let mut pixels = vec![0xEEu8; 32];
        for row in 0..2 {
            for col in 0..3 {
                let i = row * 16 + col * 4;
                pixels[i..i + 4].copy_from_slice(&[row as u8, col as u8, 9, 255]);
            }
        }

        let frame = RawFrame::from_surface(&pixels, 3, 2, 16, 2, 2, 40);
        assert!(frame.is_well_formed());
        assert_eq!(frame.timestamp_ms, 40);
        assert_eq!(&frame.data[0..4], &[0, 0, 9, 255]);
        assert_eq!(&frame.data[4..8], &[0, 1, 9, 255]);
        assert_eq!(&frame.data[8..12], &[1, 0, 9, 255]);
        assert_eq!(&frame.data[12..16], &[1, 1, 9, 255]);
    }

    #[test]
    fn from_surface_pads_small_surfaces() {
        let pixels = vec![200u8; 2 * 2 * 4];
        let frame = RawFrame::from_surface(&pixels, 2, 2, 8, 4, 4, 0);
        assert!(frame.is_well_formed());
        assert_eq!(frame.data[0], 200);
        // Column 2 of row 0 and the whole of row 2 are padding.
        assert_eq!(frame.data[8], 0);
        assert!(frame.data[32..48].iter().all(|&b| b == 0));
    }

    #[test]
    fn access_unit_classifies_idr() {
        let stream = [
            0, 0, 0, 1, 0x67, 0x42, // SPS
            0, 0, 0, 1, 0x68, 0xCE, // PPS
            0, 0, 1, 0x65, 0x88, 0x84, // IDR slice
        ];
        let au = EncodedAccessUnit::from_annexb(&stream, 33);
        assert_eq!(au.unit_types(), vec![7, 8, 5]);
        assert!(au.is_keyframe);
        assert!(au.contains_parameter_sets());
        assert_eq!(au.to_annexb().as_ref(), &stream[..]);
    }

    #[test]
    fn access_unit_delta_frame() {
        let stream = [0, 0, 0, 1, 0x41, 0x9A, 0x02];
        let au = EncodedAccessUnit::from_annexb(&stream, 66);
        assert!(!au.is_keyframe);
        assert!(!au.contains_parameter_sets());
        assert_eq!(au.len(), stream.len());
    }
}
