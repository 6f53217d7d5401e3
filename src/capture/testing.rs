//! Scripted capture backends for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::capture::cursor::{CursorShape, CursorSource, CursorState};
use crate::capture::desktop::InputDesktop;
use crate::capture::fallback::ScreenCopier;
use crate::capture::gpu::{AcquireOutcome, DuplicatedOutput, DuplicationApi, FrameError, RawFrame};
use crate::capture::types::{Bitmap, Rect, Rotation};
use crate::error::CaptureError;

pub(crate) type Script = Arc<Mutex<VecDeque<Result<AcquireOutcome, FrameError>>>>;

pub(crate) struct ScriptedOutput {
    bounds: Rect,
    script: Script,
}

impl DuplicatedOutput for ScriptedOutput {
    fn bounds(&self) -> Rect {
        self.bounds
    }

    fn rotation(&self) -> Rotation {
        Rotation::Identity
    }

    fn acquire_frame(&mut self) -> Result<AcquireOutcome, FrameError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(AcquireOutcome::NoChanges))
    }

    fn release_frame(&mut self) {}
}

/// Duplication API whose outputs replay a shared script
#[derive(Clone, Default)]
pub(crate) struct ScriptedApi {
    pub script: Script,
    pub opens: Arc<AtomicUsize>,
    pub bounds: Arc<Mutex<Vec<(String, Rect)>>>,
}

impl ScriptedApi {
    pub fn push(&self, step: Result<AcquireOutcome, FrameError>) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn with_output(self, name: &str, bounds: Rect) -> Self {
        self.bounds.lock().unwrap().push((name.to_string(), bounds));
        self
    }
}

impl DuplicationApi for ScriptedApi {
    type Output = ScriptedOutput;

    fn open_output(&mut self, device_name: &str) -> Result<ScriptedOutput, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let bounds = self
            .bounds
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == device_name)
            .map(|(_, bounds)| *bounds)
            .unwrap_or(Rect::new(0, 0, 1920, 1080));
        Ok(ScriptedOutput {
            bounds,
            script: Arc::clone(&self.script),
        })
    }
}

/// GPU frame of the given size with the given dirty rects
pub(crate) fn gpu_frame(width: u32, height: u32, dirty: Vec<Rect>) -> Result<AcquireOutcome, FrameError> {
    Ok(AcquireOutcome::Frame(RawFrame {
        bitmap: Bitmap::new(width, height),
        dirty_rects: dirty,
    }))
}

/// Copier over a shared virtual-desktop bitmap whose top-left is `origin`
#[derive(Clone)]
pub(crate) struct FakeScreen {
    pub pixels: Arc<Mutex<Bitmap>>,
    pub origin: (i32, i32),
    pub calls: Arc<AtomicUsize>,
}

impl FakeScreen {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: Arc::new(Mutex::new(Bitmap::new(width, height))),
            origin: (0, 0),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ScreenCopier for FakeScreen {
    fn copy_area(&mut self, area: Rect) -> Result<Bitmap, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let local = area.offset(-self.origin.0, -self.origin.1);
        self.pixels
            .lock()
            .unwrap()
            .crop(local)
            .map_err(|e| CaptureError::ScreenCopyFailed(e.to_string()))
    }
}

/// Input desktop that can never be attached
pub(crate) struct FailingDesktop;

impl InputDesktop for FailingDesktop {
    fn switch_to_input_desktop(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::DesktopSwitchFailed("denied".to_string()))
    }
}

/// Visible 4x4 pointer walking through `positions`; the last one repeats
pub(crate) struct PathCursor {
    positions: VecDeque<(i32, i32)>,
    shape: Arc<CursorShape>,
}

impl PathCursor {
    pub fn new(positions: Vec<(i32, i32)>) -> Self {
        Self {
            positions: positions.into(),
            shape: Arc::new(CursorShape {
                image: Bitmap::filled(4, 4, [255, 255, 255, 255]),
                hotspot_x: 0,
                hotspot_y: 0,
            }),
        }
    }
}

impl CursorSource for PathCursor {
    fn query(&mut self) -> Option<CursorState> {
        let (x, y) = if self.positions.len() > 1 {
            self.positions.pop_front()?
        } else {
            *self.positions.front()?
        };
        Some(CursorState {
            visible: true,
            x,
            y,
            kind: Default::default(),
            shape: Some(Arc::clone(&self.shape)),
        })
    }
}
