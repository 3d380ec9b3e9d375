//! `framecast`: capture the primary monitor to H.264 and report what comes out.
//!
//! ```text
//! framecast --width 1920 --height 1080 --fps 30 --bitrate 5000 --duration-secs 10
//! framecast --synthetic --software          # no desktop needed
//! RUST_LOG=framecast_sender=debug framecast
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use framecast_capture::synthetic::SyntheticControl;
use framecast_core::{config::DEFAULT_BITRATE_KBPS, CaptureConfig};
use framecast_sender::{CaptureService, FailoverStrategy};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "framecast", version, about = "Screen capture to H.264")]
struct Args {
    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Target bitrate in kbps.
    #[arg(long, default_value_t = DEFAULT_BITRATE_KBPS)]
    bitrate: u32,

    /// Use the software encoder even when a hardware one is available.
    #[arg(long)]
    software: bool,

    /// Stop after this many seconds; runs until Ctrl-C when omitted.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Capture a generated test pattern instead of the desktop.
    #[arg(long)]
    synthetic: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!("Framecast sender v{}", env!("CARGO_PKG_VERSION"));

    let config = CaptureConfig {
        width: args.width,
        height: args.height,
        fps: args.fps,
        bitrate_kbps: args.bitrate,
        use_hardware_encoder: !args.software,
    };

    let strategy = if args.synthetic {
        FailoverStrategy::synthetic(Arc::new(SyntheticControl::default()))
    } else {
        FailoverStrategy::platform()
    };
    let mut service = CaptureService::with_strategy(strategy);

    let frames = Arc::new(AtomicU64::new(0));
    let keyframes = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    {
        let (frames, keyframes, bytes) = (Arc::clone(&frames), Arc::clone(&keyframes), Arc::clone(&bytes));
        service.on_frame(move |frame| {
            let n = frames.fetch_add(1, Ordering::Relaxed) + 1;
            bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
            if frame.is_keyframe {
                keyframes.fetch_add(1, Ordering::Relaxed);
            }
            if n % 100 == 0 {
                info!("Frames received: {} (last at {:.0}ms, {} bytes)", n, frame.timestamp, frame.data.len());
            }
        });
    }
    service.on_error(|message| error!("Capture error: {}", message));

    service.start(config).context("start capture")?;
    info!("Backend: {:?}", service.active_backend());

    let started = Instant::now();
    match args.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
            info!("Ctrl-C received");
        }
    }
    service.stop();

    let elapsed = started.elapsed().as_secs_f64();
    let n = frames.load(Ordering::Relaxed);
    info!(
        "Captured {} frames ({} keyframes) in {:.1}s: {:.1} fps, {:.0} kbps",
        n,
        keyframes.load(Ordering::Relaxed),
        elapsed,
        n as f64 / elapsed.max(f64::EPSILON),
        bytes.load(Ordering::Relaxed) as f64 * 8.0 / 1000.0 / elapsed.max(f64::EPSILON),
    );
    Ok(())
}
