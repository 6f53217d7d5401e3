//! Screen capture engine
//!
//! This module turns the live desktop into changed-region bitmaps:
//! - Display enumeration and caching (`display`)
//! - GPU output duplication with a per-target fault cache (`gpu`, `fault`)
//! - Whole-rectangle software copy (`fallback`)
//! - Pointer compositing (`cursor`) and input-desktop attach (`desktop`)
//! - Rate-limited warnings for failures retried every frame (`failure_log`)
//! - Per-call backend choice (`orchestrator`) and the capture loop (`streamer`)

pub mod cursor;
pub mod desktop;
pub mod display;
pub mod failure_log;
pub mod fallback;
pub mod fault;
pub mod gpu;
pub mod orchestrator;
pub mod streamer;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cursor::{CursorCompositor, CursorKind, CursorShape, CursorSource, CursorState};
pub use display::{DisplayRegistry, DisplaySource, StaticDisplaySource};
pub use failure_log::FailureLog;
pub use fallback::{FallbackBackend, ScreenCopier};
pub use fault::{FaultCache, FaultSignal};
pub use gpu::{
    AcquireOutcome, DuplicatedOutput, DuplicationApi, FrameError, GpuBackend, RawFrame, SystemDuplication,
};
pub use orchestrator::CaptureOrchestrator;
pub use streamer::{FrameBatch, FrameStreamer, StreamerCommand, StreamerEvent, StreamerHandle};
pub use types::{Bitmap, CaptureResult, CapturedFrame, DirtyRects, DisplayInfo, Rect, Rotation};
