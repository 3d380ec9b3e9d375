//! framecast-core: shared types for the Framecast capture → encode pipeline.
//!
//! ```text
//! OS surface ─► RawFrame (BGRA) ─► PlanarFrame (I420) ─► EncodedAccessUnit (Annex B)
//! ```

pub mod config;
pub mod errors;
pub mod nal;
pub mod types;

pub use config::CaptureConfig;
pub use errors::CaptureError;
pub use types::*;
