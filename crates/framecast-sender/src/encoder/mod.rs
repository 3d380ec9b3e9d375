//! H.264 encoding with a fixed streaming profile.
//!
//! [`FrameEncoder`] owns a codec backend and enforces the stream contract on
//! top of it, whatever the backend does internally:
//!
//! - an IDR exactly every `fps` frames (1st, `fps+1`th, `2·fps+1`th, …),
//! - SPS/PPS in front of every IDR,
//! - one [`EncodedAccessUnit`] per codec output, units in emission order.

use anyhow::Result;
use bytes::Bytes;
use framecast_core::{nal, CaptureConfig, CaptureError, EncodedAccessUnit, PlanarFrame};

#[cfg(feature = "gstreamer")]
mod gst;
mod software;

// ── StreamingProfile ─────────────────────────────────────────────────────────

/// Codec parameters for real-time delivery, derived once from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Average bitrate target.
    pub bitrate_kbps: u32,
    pub peak_bitrate_kbps: u32,
    pub vbv_buffer_kbits: u32,
    /// Maximum and minimum keyframe interval, in frames.
    pub keyint: u32,
    pub min_keyint: u32,
}

impl StreamingProfile {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            bitrate_kbps: config.bitrate_kbps,
            peak_bitrate_kbps: config.peak_bitrate_kbps(),
            vbv_buffer_kbits: config.vbv_buffer_kbits(),
            keyint: config.fps,
            min_keyint: config.fps,
        }
    }

    /// x264 `option-string`: fixed GOP, no scene-cut or periodic intra
    /// refresh, no look-ahead or B-frames, headers repeated on every IDR.
    pub fn x264_options(&self) -> String {
        format!(
            "keyint={}:min-keyint={}:scenecut=0:intra-refresh=0:rc-lookahead=0:bframes=0:\
             repeat-headers=1:annexb=1:vbv-maxrate={}:vbv-bufsize={}",
            self.keyint, self.min_keyint, self.peak_bitrate_kbps, self.vbv_buffer_kbits
        )
    }

    /// Whether frame number `index` (zero-based) opens a GOP.
    pub fn is_gop_start(&self, index: u64) -> bool {
        index % self.keyint.max(1) as u64 == 0
    }
}

// ── Codec backends ───────────────────────────────────────────────────────────

/// One chunk of Annex B output from a codec backend.
pub(crate) struct CodecOutput {
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

pub(crate) trait Codec: Send {
    fn name(&self) -> &'static str;

    /// Encode one frame. `force_keyframe` requests an IDR for this frame.
    fn encode(
        &mut self,
        frame: &PlanarFrame,
        timestamp_ms: u64,
        force_keyframe: bool,
    ) -> Result<Vec<CodecOutput>>;

    /// Drain everything still buffered inside the codec.
    fn flush(&mut self) -> Result<Vec<CodecOutput>>;
}

fn create_codec(config: &CaptureConfig, profile: &StreamingProfile) -> Result<Box<dyn Codec>> {
    if config.use_hardware_encoder {
        #[cfg(feature = "gstreamer")]
        {
            match gst::GstCodec::new(profile) {
                Ok(codec) => return Ok(Box::new(codec)),
                Err(e) => tracing::warn!("[FrameEncoder] Hardware encoder unavailable ({:#}); using OpenH264", e),
            }
        }
        #[cfg(not(feature = "gstreamer"))]
        {
            tracing::warn!("[FrameEncoder] Built without GStreamer; hardware encoding unavailable, using OpenH264");
        }
    }
    Ok(Box::new(software::OpenH264Codec::new(profile)?))
}

// ── FrameEncoder ─────────────────────────────────────────────────────────────

pub struct FrameEncoder {
    codec: Box<dyn Codec>,
    profile: StreamingProfile,
    frames_in: u64,
    keyframes_out: u64,
    /// Most recent SPS and PPS units seen in the output.
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl FrameEncoder {
    /// Validate the config and create the codec. No encoder is left running
    /// on failure.
    pub fn initialize(config: &CaptureConfig) -> Result<Self, CaptureError> {
        config.validate()?;
        let profile = StreamingProfile::from_config(config);
        let codec = create_codec(config, &profile)
            .map_err(|e| CaptureError::encoder_init(format!("{e:#}")))?;

        tracing::info!(
            "[FrameEncoder] {} ready: {}x{} @ {}fps, avg {}kbps, peak {}kbps, vbv {}kbit, keyint {}",
            codec.name(), profile.width, profile.height, profile.fps, profile.bitrate_kbps,
            profile.peak_bitrate_kbps, profile.vbv_buffer_kbits, profile.keyint
        );
        Ok(Self { codec, profile, frames_in: 0, keyframes_out: 0, sps: None, pps: None })
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_in
    }

    /// Encode one frame. Usually returns exactly one access unit; an empty
    /// result means the codec is still buffering.
    pub fn encode(
        &mut self,
        frame: &PlanarFrame,
        timestamp_ms: u64,
    ) -> Result<Vec<EncodedAccessUnit>, CaptureError> {
        if frame.width != self.profile.width || frame.height != self.profile.height {
            return Err(CaptureError::encode(format!(
                "frame {}x{} does not match encoder {}x{}",
                frame.width, frame.height, self.profile.width, self.profile.height
            )));
        }

        let force = self.profile.is_gop_start(self.frames_in);
        let outputs = self
            .codec
            .encode(frame, timestamp_ms, force)
            .map_err(|e| CaptureError::encode(format!("{e:#}")))?;
        self.frames_in += 1;

        Ok(self.finish_outputs(outputs))
    }

    /// Drain buffered frames, then release the codec.
    pub fn flush_and_close(mut self) -> Result<Vec<EncodedAccessUnit>, CaptureError> {
        let outputs = self
            .codec
            .flush()
            .map_err(|e| CaptureError::encode(format!("flush: {e:#}")))?;
        let units = self.finish_outputs(outputs);
        tracing::info!(
            "[FrameEncoder] Closed after {} frames ({} keyframes, {} drained)",
            self.frames_in, self.keyframes_out, units.len()
        );
        Ok(units)
    }

    fn finish_outputs(&mut self, outputs: Vec<CodecOutput>) -> Vec<EncodedAccessUnit> {
        outputs
            .into_iter()
            .map(|out| EncodedAccessUnit::from_annexb(&out.data, out.timestamp_ms))
            .filter(|au| !au.is_empty())
            .map(|au| self.with_parameter_sets(au))
            .collect()
    }

    /// Remember the latest SPS/PPS and put them in front of any IDR that
    /// arrived without them.
    fn with_parameter_sets(&mut self, mut au: EncodedAccessUnit) -> EncodedAccessUnit {
        for unit in &au.units {
            match nal::unit_type(unit) {
                Some(nal::NAL_SPS) => self.sps = Some(unit.clone()),
                Some(nal::NAL_PPS) => self.pps = Some(unit.clone()),
                _ => {}
            }
        }

        if au.is_keyframe {
            self.keyframes_out += 1;
            if !au.contains_parameter_sets() {
                if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                    au.units.insert(0, pps.clone());
                    au.units.insert(0, sps.clone());
                } else {
                    tracing::warn!("[FrameEncoder] Keyframe without parameter sets and none cached");
                }
            }
            tracing::trace!("[FrameEncoder] Keyframe at {}ms ({} bytes)", au.timestamp_ms, au.len());
        }
        au
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        outputs: Vec<Vec<u8>>,
        forced: Vec<bool>,
    }

    impl Codec for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn encode(&mut self, _f: &PlanarFrame, ts: u64, force: bool) -> Result<Vec<CodecOutput>> {
            self.forced.push(force);
            Ok(self.outputs.pop().map(|data| CodecOutput { data, timestamp_ms: ts }).into_iter().collect())
        }
        fn flush(&mut self) -> Result<Vec<CodecOutput>> {
            Ok(Vec::new())
        }
    }

    fn scripted(fps: u32, outputs: Vec<Vec<u8>>) -> FrameEncoder {
        let profile = StreamingProfile::from_config(&CaptureConfig::new(4, 4, fps));
        FrameEncoder {
            codec: Box::new(Scripted { outputs, forced: Vec::new() }),
            profile,
            frames_in: 0,
            keyframes_out: 0,
            sps: None,
            pps: None,
        }
    }

    #[test]
    fn profile_matches_streaming_policy() {
        let mut config = CaptureConfig::new(1920, 1080, 30);
        config.bitrate_kbps = 6000;
        let profile = StreamingProfile::from_config(&config);
        assert_eq!(profile.peak_bitrate_kbps, 9000);
        assert_eq!(profile.vbv_buffer_kbits, 6000);
        assert_eq!((profile.keyint, profile.min_keyint), (30, 30));
        assert_eq!(
            profile.x264_options(),
            "keyint=30:min-keyint=30:scenecut=0:intra-refresh=0:rc-lookahead=0:bframes=0:\
             repeat-headers=1:annexb=1:vbv-maxrate=9000:vbv-bufsize=6000"
        );
    }

    #[test]
    fn gop_start_every_fps_frames() {
        let profile = StreamingProfile::from_config(&CaptureConfig::new(4, 4, 30));
        let starts: Vec<u64> = (0..91).filter(|&i| profile.is_gop_start(i)).collect();
        assert_eq!(starts, vec![0, 30, 60, 90]);
    }

    #[test]
    fn parameter_sets_are_prepended_to_bare_idr() {
        let sps_pps_idr = vec![0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68, 2, 0, 0, 0, 1, 0x65, 3];
        let bare_idr = vec![0, 0, 0, 1, 0x65, 4];
        // Scripted pops from the back.
        let mut encoder = scripted(2, vec![bare_idr, sps_pps_idr]);
        let frame = PlanarFrame::new(4, 4);

        let first = encoder.encode(&frame, 0).unwrap();
        assert_eq!(first[0].unit_types(), vec![7, 8, 5]);

        let second = encoder.encode(&frame, 33).unwrap();
        assert!(second[0].is_keyframe);
        assert_eq!(second[0].unit_types(), vec![7, 8, 5]);
        assert_eq!(second[0].timestamp_ms, 33);
    }

    #[test]
    fn empty_codec_output_yields_no_units() {
        let mut encoder = scripted(30, Vec::new());
        let units = encoder.encode(&PlanarFrame::new(4, 4), 0).unwrap();
        assert!(units.is_empty());
        assert_eq!(encoder.frames_encoded(), 1);
    }

    #[test]
    fn mismatched_frame_is_an_encode_error() {
        let mut encoder = scripted(30, Vec::new());
        let err = encoder.encode(&PlanarFrame::new(8, 8), 0).unwrap_err();
        assert!(matches!(err, CaptureError::Encode { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn invalid_config_fails_initialization() {
        let config = CaptureConfig::new(641, 480, 30);
        assert!(matches!(
            FrameEncoder::initialize(&config),
            Err(CaptureError::Configuration { .. })
        ));
    }

    // ── OpenH264 end to end ──────────────────────────────────────────────────

    fn software_config(fps: u32) -> CaptureConfig {
        let mut config = CaptureConfig::new(64, 64, fps);
        config.bitrate_kbps = 2000;
        config.use_hardware_encoder = false;
        config
    }

    fn gradient(frame_no: u32) -> PlanarFrame {
        let mut frame = PlanarFrame::new(64, 64);
        for (i, y) in frame.y.iter_mut().enumerate() {
            *y = ((i as u32 + frame_no) % 256) as u8;
        }
        frame.u.fill(128);
        frame.v.fill(128);
        frame
    }

    #[test]
    fn keyframe_cadence_follows_fps() {
        let fps = 30;
        let mut encoder = FrameEncoder::initialize(&software_config(fps)).unwrap();
        assert_eq!(encoder.codec_name(), "openh264");

        let mut keyframes = Vec::new();
        for n in 0..(fps * 3 + 1) {
            let units = encoder.encode(&gradient(n), n as u64 * 33).unwrap();
            assert_eq!(units.len(), 1, "frame {n} should produce exactly one access unit");
            let au = &units[0];
            if au.is_keyframe {
                assert!(au.contains_parameter_sets(), "keyframe {n} lacks SPS/PPS");
                keyframes.push(n);
            }
        }
        // 1st, 31st, 61st, 91st frames (zero-based 0, 30, 60, 90).
        assert_eq!(keyframes, vec![0, 30, 60, 90]);

        assert!(encoder.flush_and_close().unwrap().is_empty());
    }

    #[test]
    fn access_units_start_with_start_codes() {
        let mut encoder = FrameEncoder::initialize(&software_config(10)).unwrap();
        let units = encoder.encode(&gradient(0), 0).unwrap();
        let bytes = units[0].to_annexb();
        assert!(bytes.starts_with(&[0, 0, 0, 1]) || bytes.starts_with(&[0, 0, 1]));
        assert!(units[0].units.iter().all(|u| nal::strip_start_code(u).is_some()));
    }
}
