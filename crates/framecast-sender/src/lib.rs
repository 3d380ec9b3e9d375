//! framecast-sender: the capture → H.264 pipeline.
//!
//! ```text
//! CaptureBackend (producer thread)
//!   │ RawFrame (BGRA)
//!   ▼
//! convert ──► PlanarFrame (I420) ──► FrameEncoder ──► EncodedAccessUnit
//!                                                          │
//!                                     FrameDispatcher ◄────┘  (bounded, non-blocking)
//!                                          │ consumer thread
//!                                          ▼
//!                                 on_frame / on_error callbacks
//! ```
//!
//! [`CaptureService`] is the host-facing surface; [`CaptureSession`] is one
//! start-to-stop run of the pipeline.

pub mod convert;
pub mod dispatcher;
pub mod encoder;
pub mod service;
pub mod session;

pub use dispatcher::{DeliveredFrame, DispatchHandle, ErrorCallback, FrameCallback, FrameDispatcher, FRAME_FORMAT};
pub use encoder::{FrameEncoder, StreamingProfile};
pub use service::CaptureService;
pub use session::{BackendFactory, CaptureSession, FailoverStrategy};
