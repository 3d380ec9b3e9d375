//! BGRA → I420 colour conversion.
//!
//! Fixed-point BT.601-style coefficients, integer arithmetic only:
//!
//! ```text
//! Y = ( 77R + 150G +  29B) >> 8
//! U = ((-43R −  85G + 128B) >> 8) + 128
//! V = ((128R − 107G −  21B) >> 8) + 128
//! ```
//!
//! Chroma is taken from the top-left pixel of each 2×2 block, not averaged.

use framecast_core::{PlanarFrame, RawFrame};

/// Convert a packed BGRA frame into a freshly allocated planar frame.
pub fn convert(raw: &RawFrame) -> PlanarFrame {
    let mut planar = PlanarFrame::new(raw.width, raw.height);
    convert_into(raw, &mut planar);
    planar
}

/// Convert into existing planes, reallocating only when the size changed.
pub fn convert_into(raw: &RawFrame, out: &mut PlanarFrame) {
    if out.width != raw.width || out.height != raw.height {
        *out = PlanarFrame::new(raw.width, raw.height);
    }

    let width = raw.width as usize;
    let stride = width * 4;
    let chroma_width = out.chroma_width() as usize;

    for (row, bgra_row) in raw.data.chunks_exact(stride).take(raw.height as usize).enumerate() {
        let y_row = &mut out.y[row * width..(row + 1) * width];
        for (px, y) in bgra_row.chunks_exact(4).zip(y_row.iter_mut()) {
            let (b, g, r) = (px[0] as i32, px[1] as i32, px[2] as i32);
            *y = luma(r, g, b);
        }

        if row % 2 == 1 {
            continue;
        }
        let chroma_row = row / 2;
        let base = chroma_row * chroma_width;
        for col in 0..chroma_width {
            let px = &bgra_row[col * 8..col * 8 + 4];
            let (b, g, r) = (px[0] as i32, px[1] as i32, px[2] as i32);
            out.u[base + col] = chroma_u(r, g, b);
            out.v[base + col] = chroma_v(r, g, b);
        }
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    clamp((77 * r + 150 * g + 29 * b) >> 8)
}

#[inline]
fn chroma_u(r: i32, g: i32, b: i32) -> u8 {
    clamp(((-43 * r - 85 * g + 128 * b) >> 8) + 128)
}

#[inline]
fn chroma_v(r: i32, g: i32, b: i32) -> u8 {
    clamp(((128 * r - 107 * g - 21 * b) >> 8) + 128)
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, b: u8, g: u8, r: u8) -> RawFrame {
        let data = [b, g, r, 255].repeat(width as usize * height as usize);
        RawFrame { data, width, height, timestamp_ms: 0 }
    }

    #[test]
    fn white_is_full_luma_neutral_chroma() {
        let planar = convert(&solid(8, 6, 255, 255, 255));
        assert!(planar.y.iter().all(|&y| y == 255));
        assert!(planar.u.iter().all(|&u| u == 128));
        assert!(planar.v.iter().all(|&v| v == 128));
    }

    #[test]
    fn black_is_zero_luma_neutral_chroma() {
        let planar = convert(&solid(8, 6, 0, 0, 0));
        assert!(planar.y.iter().all(|&y| y == 0));
        assert!(planar.u.iter().all(|&u| u == 128));
        assert!(planar.v.iter().all(|&v| v == 128));
    }

    #[test]
    fn plane_sizes_follow_subsampling() {
        let planar = convert(&solid(16, 10, 1, 2, 3));
        assert_eq!(planar.y.len(), 160);
        assert_eq!(planar.u.len(), 8 * 5);
        assert_eq!(planar.v.len(), 8 * 5);
    }

    #[test]
    fn primaries_match_fixed_point_formula() {
        // Pure red: Y = 77*255>>8 = 76, U = (-43*255>>8)+128 = 85, V = (128*255>>8)+128 = 255.
        let red = convert(&solid(2, 2, 0, 0, 255));
        assert_eq!((red.y[0], red.u[0], red.v[0]), (76, 85, 255));

        // Pure blue: Y = 29*255>>8 = 28, U = 127+128 = 255, V = (-21*255>>8)+128 = 107.
        let blue = convert(&solid(2, 2, 255, 0, 0));
        assert_eq!((blue.y[0], blue.u[0], blue.v[0]), (28, 255, 107));
    }

    #[test]
    fn chroma_comes_from_top_left_of_block() {
        // 2×2 block: top-left red, the other three white.
        let mut raw = solid(2, 2, 255, 255, 255);
        raw.data[0..4].copy_from_slice(&[0, 0, 255, 255]);
        let planar = convert(&raw);
        assert_eq!(planar.u, vec![85]);
        assert_eq!(planar.v, vec![255]);
        assert_eq!(planar.y, vec![76, 255, 255, 255]);
    }

    #[test]
    fn conversion_is_deterministic() {
        let mut raw = solid(6, 4, 0, 0, 0);
        for (i, b) in raw.data.iter_mut().enumerate() {
            *b = (i * 37 % 251) as u8;
        }
        let first = convert(&raw);
        let mut reused = PlanarFrame::new(2, 2);
        convert_into(&raw, &mut reused);
        assert_eq!(first, reused);
        assert_eq!(first, convert(&raw));
    }
}
