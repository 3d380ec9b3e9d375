//! Producer → consumer hand-off for encoded frames and errors.
//!
//! ```text
//! producer thread (capture/encode)          consumer thread "framecast-dispatch"
//!   DispatchHandle::send_frame ──try_send──► frames rx ─┐
//!   DispatchHandle::send_error ──try_send──► errors rx ─┼─ select! ─► callbacks
//!   FrameDispatcher::shutdown ───oneshot───► close rx  ─┘   (drain, then exit)
//! ```
//!
//! The producer never waits on the consumer. When the consumer is
//! [`FRAME_QUEUE_DEPTH`] frames behind, delta frames are dropped and counted
//! until the next keyframe, which is always queued. The consumer therefore
//! never receives a delta frame whose reference was dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use framecast_core::{CaptureError, EncodedAccessUnit};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Delta frames buffered between producer and consumer. Keyframes are
/// queued past this depth.
pub const FRAME_QUEUE_DEPTH: usize = 8;
const ERROR_QUEUE_DEPTH: usize = 4;

/// Format tag of every delivered frame.
pub const FRAME_FORMAT: &str = "h264";

/// One encoded access unit as the consumer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredFrame {
    /// Annex B byte stream of the access unit.
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Milliseconds since the session started.
    pub timestamp: f64,
    pub format: &'static str,
    pub is_keyframe: bool,
}

pub type FrameCallback = Arc<dyn Fn(DeliveredFrame) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

// ── DispatchHandle ────────────────────────────────────────────────────────────

/// Producer side. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct DispatchHandle {
    frames: mpsc::UnboundedSender<DeliveredFrame>,
    errors: mpsc::Sender<String>,
    queued: Arc<AtomicUsize>,
    awaiting_keyframe: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    width: u32,
    height: u32,
}

impl DispatchHandle {
    pub fn send_frame(&self, au: &EncodedAccessUnit) {
        let frame = DeliveredFrame {
            data: au.to_annexb(),
            width: self.width,
            height: self.height,
            timestamp: au.timestamp_ms as f64,
            format: FRAME_FORMAT,
            is_keyframe: au.is_keyframe,
        };
        if self.frames.is_closed() {
            trace!("[Dispatcher] Frame after shutdown discarded");
            return;
        }

        if frame.is_keyframe {
            if self.awaiting_keyframe.swap(false, Ordering::AcqRel) {
                debug!("[Dispatcher] Resynchronised on keyframe at {}ms", frame.timestamp);
            }
        } else if self.awaiting_keyframe.load(Ordering::Acquire) {
            self.count_drop(&frame);
            return;
        } else if self.queued.load(Ordering::Acquire) >= FRAME_QUEUE_DEPTH {
            self.awaiting_keyframe.store(true, Ordering::Release);
            self.count_drop(&frame);
            return;
        }

        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.frames.send(frame).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            trace!("[Dispatcher] Frame after shutdown discarded");
        }
    }

    fn count_drop(&self, frame: &DeliveredFrame) {
        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 100 == 0 {
            warn!(
                "[Dispatcher] Consumer behind, dropped frame at {}ms ({} dropped so far)",
                frame.timestamp, n
            );
        }
    }

    pub fn send_error(&self, error: &CaptureError) {
        if let Err(e) = self.errors.try_send(error.to_string()) {
            warn!("[Dispatcher] Could not queue error \"{}\": {}", error, e);
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── FrameDispatcher ───────────────────────────────────────────────────────────

/// Owns the consumer thread. Dropping it has the same effect as
/// [`shutdown`](Self::shutdown).
pub struct FrameDispatcher {
    handle: DispatchHandle,
    close: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameDispatcher {
    /// Start the consumer thread for frames of `width`×`height`.
    pub fn spawn(
        width: u32,
        height: u32,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let (error_tx, error_rx) = mpsc::channel(ERROR_QUEUE_DEPTH);
        let (close_tx, close_rx) = oneshot::channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| CaptureError::fatal(format!("dispatcher runtime: {e}")))?;

        let depth = Arc::clone(&queued);
        let thread = thread::Builder::new()
            .name("framecast-dispatch".into())
            .spawn(move || {
                let frames = FrameQueue { rx: frame_rx, depth };
                runtime.block_on(consume(frames, error_rx, close_rx, on_frame, on_error));
            })
            .map_err(|e| CaptureError::fatal(format!("spawn dispatcher thread: {e}")))?;

        Ok(Self {
            handle: DispatchHandle {
                frames: frame_tx,
                errors: error_tx,
                queued,
                awaiting_keyframe: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicU64::new(0)),
                width,
                height,
            },
            close: Some(close_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Deliver everything already queued, then stop the consumer thread.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[Dispatcher] Consumer thread panicked");
            }
            info!(
                "[Dispatcher] Shut down ({} frames dropped)",
                self.handle.dropped_frames()
            );
        }
    }
}

impl Drop for FrameDispatcher {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

// ── Consumer thread ───────────────────────────────────────────────────────────

/// Receiving end of the frame queue; keeps the shared depth current.
struct FrameQueue {
    rx: mpsc::UnboundedReceiver<DeliveredFrame>,
    depth: Arc<AtomicUsize>,
}

impl FrameQueue {
    async fn recv(&mut self) -> Option<DeliveredFrame> {
        let frame = self.rx.recv().await;
        self.taken(frame)
    }

    fn try_recv(&mut self) -> Option<DeliveredFrame> {
        let frame = self.rx.try_recv().ok();
        self.taken(frame)
    }

    fn taken(&self, frame: Option<DeliveredFrame>) -> Option<DeliveredFrame> {
        if frame.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        frame
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

async fn consume(
    mut frames: FrameQueue,
    mut errors: mpsc::Receiver<String>,
    mut close: oneshot::Receiver<()>,
    on_frame: FrameCallback,
    on_error: ErrorCallback,
) {
    let mut delivered: u64 = 0;
    loop {
        tokio::select! {
            biased;
            Some(frame) = frames.recv() => {
                deliver_frame(&on_frame, frame);
                delivered += 1;
            }
            Some(message) = errors.recv() => deliver_error(&on_error, message),
            _ = &mut close => {
                frames.close();
                errors.close();
                while let Some(frame) = frames.try_recv() {
                    deliver_frame(&on_frame, frame);
                    delivered += 1;
                }
                while let Ok(message) = errors.try_recv() {
                    deliver_error(&on_error, message);
                }
                break;
            }
            else => break,
        }
    }
    debug!("[Dispatcher] Consumer exiting after {} frames", delivered);
}

fn deliver_frame(on_frame: &FrameCallback, frame: DeliveredFrame) {
    if panic::catch_unwind(AssertUnwindSafe(|| on_frame(frame))).is_err() {
        error!("[Dispatcher] Frame callback panicked; continuing");
    }
}

fn deliver_error(on_error: &ErrorCallback, message: String) {
    if panic::catch_unwind(AssertUnwindSafe(|| on_error(message))).is_err() {
        error!("[Dispatcher] Error callback panicked; continuing");
    }
}
