//! Software H.264 through OpenH264 (built from source, no system library).

use anyhow::{Context, Result};
use framecast_core::PlanarFrame;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig, FrameRate, IntraFramePeriod, RateControlMode, UsageType,
};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;

use super::{Codec, CodecOutput, StreamingProfile};

/// `openh264::encoder::Encoder` holds raw pointers into the C encoder and is
/// therefore `!Send`.
struct SendEncoder(Encoder);

// SAFETY: the C encoder has no thread affinity. `FrameEncoder` is only ever
// used by one thread at a time (the session keeps it behind a mutex).
unsafe impl Send for SendEncoder {}

pub(crate) struct OpenH264Codec {
    encoder: SendEncoder,
    width: usize,
    height: usize,
}

impl OpenH264Codec {
    pub(crate) fn new(profile: &StreamingProfile) -> Result<Self> {
        // `FrameEncoder` also forces an IDR on every GOP start; the codec's own
        // period matches it and scene cuts never add extra IDRs.
        let config = EncoderConfig::new()
            .usage_type(UsageType::ScreenContentRealTime)
            .bitrate(BitRate::from_bps(profile.bitrate_kbps.saturating_mul(1000)))
            .max_frame_rate(FrameRate::from_hz(profile.fps as f32))
            .rate_control_mode(RateControlMode::Bitrate)
            .intra_frame_period(IntraFramePeriod::from_num_frames(profile.keyint))
            .skip_frames(false)
            .scene_change_detect(false);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config).context("create OpenH264 encoder")?;

        tracing::info!(
            "[OpenH264] Encoder created: {}x{} @ {}fps {}kbps (keyint {})",
            profile.width, profile.height, profile.fps, profile.bitrate_kbps, profile.keyint
        );

        Ok(Self {
            encoder: SendEncoder(encoder),
            width: profile.width as usize,
            height: profile.height as usize,
        })
    }
}

impl Codec for OpenH264Codec {
    fn name(&self) -> &'static str {
        "openh264"
    }

    fn encode(
        &mut self,
        frame: &PlanarFrame,
        timestamp_ms: u64,
        force_keyframe: bool,
    ) -> Result<Vec<CodecOutput>> {
        let (w, h) = (self.width, self.height);
        anyhow::ensure!(
            frame.width as usize == w && frame.height as usize == h,
            "frame {}x{} does not match encoder {}x{}",
            frame.width, frame.height, w, h
        );

        if force_keyframe {
            self.encoder.0.force_intra_frame();
        }

        let planes = (frame.y.as_slice(), frame.u.as_slice(), frame.v.as_slice());
        let yuv = YUVSlices::new(planes, (w, h), (w, w / 2, w / 2));
        let bitstream = self.encoder.0.encode(&yuv).context("OpenH264 encode")?;
        let data = bitstream.to_vec();

        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![CodecOutput { data, timestamp_ms }])
    }

    /// OpenH264 runs without look-ahead in this configuration, so every input
    /// frame has already been emitted.
    fn flush(&mut self) -> Result<Vec<CodecOutput>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use framecast_core::{nal, CaptureConfig};

    use super::*;

    fn frame(width: u32, height: u32, n: u32) -> PlanarFrame {
        let mut frame = PlanarFrame::new(width, height);
        for (i, px) in frame.y.iter_mut().enumerate() {
            *px = ((i as u32 + n * 7) % 235) as u8 + 16;
        }
        frame.u.fill(128);
        frame.v.fill(128);
        frame
    }

    fn has_idr(output: &[CodecOutput]) -> bool {
        output.iter().any(|o| {
            nal::split_annexb(&o.data).into_iter().filter_map(nal::unit_type).any(|t| t == nal::NAL_IDR)
        })
    }

    #[test]
    fn codec_keeps_gop_period_without_forcing() {
        let mut config = CaptureConfig::new(64, 64, 10);
        config.use_hardware_encoder = false;
        let profile = StreamingProfile::from_config(&config);
        let mut codec = OpenH264Codec::new(&profile).unwrap();

        let idrs: Vec<u32> = (0..25)
            .filter(|&n| has_idr(&codec.encode(&frame(64, 64, n), n as u64 * 100, false).unwrap()))
            .collect();
        assert_eq!(idrs, vec![0, 10, 20]);
    }
}
