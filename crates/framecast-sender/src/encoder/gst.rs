//! GStreamer H.264 encode pipeline (hardware encoders, x264 as last resort).
//!
//! Encoder priority (first factory that builds wins):
//! 1. `nvh264enc` (NVIDIA NVENC)
//! 2. `qsvh264enc` (Intel Quick Sync)
//! 3. `mfh264enc` (Windows Media Foundation)
//! 4. `x264enc` (software, configured with the streaming option string)
//!
//! Pipeline:
//! ```text
//! appsrc (I420)
//!   → videoconvert
//!   → <encoder>
//!   → h264parse config-interval=-1        (SPS/PPS before every IDR)
//!   → video/x-h264,stream-format=byte-stream,alignment=au
//!   → appsink
//! ```

use anyhow::{Context, Result};
use framecast_core::PlanarFrame;
use gstreamer::{self as gst, prelude::*};
use gstreamer_app::{AppSink, AppSrc};

use super::{Codec, CodecOutput, StreamingProfile};

const ENCODER_CANDIDATES: &[&str] = &["nvh264enc", "qsvh264enc", "mfh264enc", "x264enc"];

/// How long `encode` waits for the access unit of the frame it just pushed.
const PULL_TIMEOUT_MS: u64 = 100;
/// How long `flush` waits for each trailing access unit after EOS.
const DRAIN_TIMEOUT_MS: u64 = 500;

// ── Encoder selection ─────────────────────────────────────────────────────────

fn encoder_element(name: &str, profile: &StreamingProfile) -> String {
    let StreamingProfile { fps, bitrate_kbps, peak_bitrate_kbps, vbv_buffer_kbits, .. } = *profile;
    match name {
        "nvh264enc" => format!(
            "nvh264enc bitrate={bitrate_kbps} max-bitrate={peak_bitrate_kbps} \
             vbv-buffer-size={vbv_buffer_kbits} gop-size={fps} bframes=0 \
             rc-lookahead=0 zerolatency=true preset=low-latency-hq"
        ),
        "qsvh264enc" => format!(
            "qsvh264enc bitrate={bitrate_kbps} max-bitrate={peak_bitrate_kbps} \
             gop-size={fps} b-frames=0 rate-control=vbr"
        ),
        "mfh264enc" => format!(
            "mfh264enc bitrate={bitrate_kbps} gop-size={fps} bframes=0 \
             low-latency=true quality-vs-speed=100"
        ),
        _ => format!(
            "x264enc bitrate={bitrate_kbps} speed-preset=ultrafast tune=zerolatency \
             key-int-max={fps} bframes=0 option-string=\"{}\"",
            profile.x264_options()
        ),
    }
}

fn pipeline_description(name: &str, profile: &StreamingProfile) -> String {
    let StreamingProfile { width, height, fps, .. } = *profile;
    format!(
        "appsrc name=src is-live=true format=time \
         caps=video/x-raw,format=I420,width={width},height={height},framerate={fps}/1 \
         ! videoconvert \
         ! {} \
         ! h264parse config-interval=-1 \
         ! video/x-h264,stream-format=byte-stream,alignment=au \
         ! appsink name=sink sync=false",
        encoder_element(name, profile)
    )
}

// ── GstCodec ──────────────────────────────────────────────────────────────────

pub(crate) struct GstCodec {
    pipeline: gst::Pipeline,
    appsrc:   AppSrc,
    appsink:  AppSink,
    name:     &'static str,
    frame_bytes: usize,
}

impl GstCodec {
    /// Try each available encoder factory in priority order.
    pub(crate) fn new(profile: &StreamingProfile) -> Result<Self> {
        gst::init().context("gst::init")?;

        let mut last_error = None;
        for &name in ENCODER_CANDIDATES {
            if gst::ElementFactory::find(name).is_none() {
                tracing::debug!("[GstEncoder] {} not available", name);
                continue;
            }
            match Self::build(name, profile) {
                Ok(codec) => return Ok(codec),
                Err(e) => {
                    tracing::warn!("[GstEncoder] {} unusable: {:#}", name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no GStreamer H.264 encoder installed")))
    }

    fn build(name: &'static str, profile: &StreamingProfile) -> Result<Self> {
        let desc = pipeline_description(name, profile);
        tracing::debug!("[GstEncoder] Pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .context("GStreamer pipeline parse")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Pipeline downcast failed"))?;

        let appsrc = pipeline
            .by_name("src")
            .context("src element")?
            .downcast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("AppSrc downcast"))?;

        let appsink = pipeline
            .by_name("sink")
            .context("sink element")?
            .downcast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("AppSink downcast"))?;

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(anyhow::anyhow!("Pipeline → Playing: {e}"));
        }
        tracing::info!(
            "[GstEncoder] Pipeline running: {}×{} @{}fps {}kbps ({})",
            profile.width, profile.height, profile.fps, profile.bitrate_kbps, name
        );

        let luma = profile.width as usize * profile.height as usize;
        Ok(Self { pipeline, appsrc, appsink, name, frame_bytes: luma + luma / 2 })
    }

    fn pull(&self, timeout_ms: u64) -> Option<CodecOutput> {
        let sample = self.appsink.try_pull_sample(gst::ClockTime::from_mseconds(timeout_ms))?;
        let buf = sample.buffer()?;
        let map = buf.map_readable().ok()?;
        let timestamp_ms = buf.pts().map(|t| t.mseconds()).unwrap_or(0);
        Some(CodecOutput { data: map.as_slice().to_vec(), timestamp_ms })
    }
}

impl Codec for GstCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn encode(
        &mut self,
        frame: &PlanarFrame,
        timestamp_ms: u64,
        force_keyframe: bool,
    ) -> Result<Vec<CodecOutput>> {
        if force_keyframe {
            let event = gstreamer_video::DownstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !self.appsrc.send_event(event) {
                tracing::trace!("[GstEncoder] force-key-unit event not handled");
            }
        }

        let mut buf = gst::Buffer::with_size(self.frame_bytes).context("Buffer::with_size")?;
        {
            let buf_mut = buf.get_mut().context("fresh buffer is writable")?;
            buf_mut.set_pts(gst::ClockTime::from_mseconds(timestamp_ms));
            let mut map = buf_mut.map_writable().context("buffer map")?;
            let dst = map.as_mut_slice();
            let (y, rest) = dst.split_at_mut(frame.y.len());
            let (u, v) = rest.split_at_mut(frame.u.len());
            y.copy_from_slice(&frame.y);
            u.copy_from_slice(&frame.u);
            v.copy_from_slice(&frame.v);
        }
        self.appsrc
            .push_buffer(buf)
            .map_err(|e| anyhow::anyhow!("push_buffer: {e}"))?;

        let mut out = Vec::new();
        if let Some(first) = self.pull(PULL_TIMEOUT_MS) {
            out.push(first);
            while let Some(more) = self.pull(0) {
                out.push(more);
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<CodecOutput>> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| anyhow::anyhow!("end_of_stream: {e}"))?;
        let mut out = Vec::new();
        while !self.appsink.is_eos() {
            match self.pull(DRAIN_TIMEOUT_MS) {
                Some(au) => out.push(au),
                None => break,
            }
        }
        let _ = self.pipeline.set_state(gst::State::Null);
        Ok(out)
    }
}

impl Drop for GstCodec {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
