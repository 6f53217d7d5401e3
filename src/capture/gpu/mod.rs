//! GPU-accelerated capture through output duplication
//!
//! `GpuBackend` owns at most one `GpuCaptureHandle` and a `FaultCache`.
//! The platform side is abstracted by `DuplicationApi`, so the fault,
//! rotation and dirty-rect logic is shared by DXGI and tests.

#[cfg(windows)]
pub mod dxgi;

use tracing::{debug, info, warn};

use crate::capture::cursor::CursorCompositor;
use crate::capture::fault::{FaultCache, FaultSignal};
use crate::capture::types::{Bitmap, CaptureResult, CapturedFrame, DirtyRects, Rect, Rotation};
use crate::error::CaptureError;

/// `DXGI_ERROR_WAIT_TIMEOUT`
pub const WAIT_TIMEOUT_CODE: u32 = 0x887A_0027;
/// `DXGI_ERROR_ACCESS_LOST`
pub const ACCESS_LOST_CODE: u32 = 0x887A_0026;
/// `DXGI_ERROR_DEVICE_REMOVED`
pub const DEVICE_REMOVED_CODE: u32 = 0x887A_0005;
/// `E_ACCESSDENIED`
pub const ACCESS_DENIED_CODE: u32 = 0x8007_0005;

/// What to do with a frame acquisition error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorAction {
    /// Treat as an idle poll
    NoChanges,
    /// Dispose the handle and fault the target
    Fault,
}

/// Error codes that do not fault; anything else does
const FRAME_ERROR_POLICY: &[(u32, FrameErrorAction)] = &[(WAIT_TIMEOUT_CODE, FrameErrorAction::NoChanges)];

/// Classification of frame acquisition errors
pub struct FrameErrorPolicy;

impl FrameErrorPolicy {
    /// Looks up the action for an OS error code
    pub fn classify(code: u32) -> FrameErrorAction {
        FRAME_ERROR_POLICY
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, action)| *action)
            .unwrap_or(FrameErrorAction::Fault)
    }
}

/// Raw frame as delivered by the duplication API
#[derive(Debug)]
pub struct RawFrame {
    /// Texture contents, not yet rotated upright
    pub bitmap: Bitmap,
    /// Texture-space dirty rectangles
    pub dirty_rects: Vec<Rect>,
}

/// Outcome of a successful poll
#[derive(Debug)]
pub enum AcquireOutcome {
    /// No new frame accumulated
    NoChanges,
    /// A new frame
    Frame(RawFrame),
}

/// Failed poll, with the OS error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameError {
    /// Call that failed
    pub context: &'static str,
    /// Raw `HRESULT`
    pub code: u32,
}

impl From<FrameError> for CaptureError {
    fn from(err: FrameError) -> Self {
        if err.code == ACCESS_LOST_CODE {
            CaptureError::AccessLost
        } else {
            CaptureError::Os {
                context: err.context,
                code: err.code,
            }
        }
    }
}

/// One duplicated output
///
/// Dropping it releases every native resource it holds.
pub trait DuplicatedOutput: Send {
    /// Bounds of the output in virtual-desktop coordinates
    fn bounds(&self) -> Rect;

    /// Orientation of the output
    fn rotation(&self) -> Rotation;

    /// Polls for a new frame without blocking
    fn acquire_frame(&mut self) -> Result<AcquireOutcome, FrameError>;

    /// Releases the frame held since the last acquire; best effort
    fn release_frame(&mut self);
}

/// Platform output duplication
pub trait DuplicationApi: Send {
    /// Output type produced by this API
    type Output: DuplicatedOutput;

    /// Finds the output named `device_name` and starts duplicating it
    fn open_output(&mut self, device_name: &str) -> Result<Self::Output, CaptureError>;
}

/// API for platforms without output duplication
#[derive(Debug, Default)]
pub struct UnsupportedDuplication;

/// Never constructed
#[derive(Debug)]
pub enum NoOutput {}

impl DuplicatedOutput for NoOutput {
    fn bounds(&self) -> Rect {
        match *self {}
    }

    fn rotation(&self) -> Rotation {
        match *self {}
    }

    fn acquire_frame(&mut self) -> Result<AcquireOutcome, FrameError> {
        match *self {}
    }

    fn release_frame(&mut self) {
        match *self {}
    }
}

impl DuplicationApi for UnsupportedDuplication {
    type Output = NoOutput;

    fn open_output(&mut self, _device_name: &str) -> Result<NoOutput, CaptureError> {
        Err(CaptureError::GpuUnsupported)
    }
}

/// Duplication API for this platform
#[cfg(windows)]
pub type SystemDuplication = dxgi::DxgiDuplication;

/// Duplication API for this platform
#[cfg(not(windows))]
pub type SystemDuplication = UnsupportedDuplication;

/// Returns true if this build has a GPU capture path
pub const fn gpu_capture_supported() -> bool {
    cfg!(windows)
}

/// Live duplication of one target
pub struct GpuCaptureHandle<O> {
    target: String,
    output: O,
}

impl<O: DuplicatedOutput> GpuCaptureHandle<O> {
    /// Name of the duplicated target
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Bounds of the target
    pub fn bounds(&self) -> Rect {
        self.output.bounds()
    }

    /// Orientation of the target
    pub fn rotation(&self) -> Rotation {
        self.output.rotation()
    }
}

/// GPU capture backend
pub struct GpuBackend<A: DuplicationApi> {
    api: A,
    faults: FaultCache,
    current: Option<GpuCaptureHandle<A::Output>>,
    signal: FaultSignal,
}

impl<A: DuplicationApi> GpuBackend<A> {
    /// Creates a backend with an empty fault cache
    pub fn new(api: A, faults: FaultCache) -> Self {
        Self {
            api,
            faults,
            current: None,
            signal: FaultSignal::new(),
        }
    }

    /// Returns a signal other threads may raise to fault the current target
    pub fn fault_signal(&self) -> FaultSignal {
        self.signal.clone()
    }

    /// Returns true if `target` is inside its fault TTL
    pub fn is_faulted(&mut self, target: &str) -> bool {
        self.faults.contains(target)
    }

    /// Returns the live handle, if any
    pub fn current(&self) -> Option<&GpuCaptureHandle<A::Output>> {
        self.current.as_ref()
    }

    fn drain_signal(&mut self) {
        if self.signal.take() {
            debug!("Fault requested for the current GPU target");
            self.set_faulted();
        }
    }

    /// Ensures a handle for `target` exists
    ///
    /// Does nothing while the target is faulted, and reuses the current
    /// handle when it already points at `target`.
    pub fn duplicate_output(&mut self, target: &str) -> Option<&GpuCaptureHandle<A::Output>> {
        self.drain_signal();

        if self.faults.contains(target) {
            return None;
        }

        if self.current.as_ref().is_some_and(|h| h.target == target) {
            return self.current.as_ref();
        }

        // The old handle must be gone before a new duplication is created
        if let Some(old) = self.current.take() {
            debug!("Releasing GPU duplication of {}", old.target);
            drop(old);
        }

        match self.api.open_output(target) {
            Ok(output) => {
                info!("Started GPU duplication of {} at {}", target, output.bounds());
                self.current = Some(GpuCaptureHandle {
                    target: target.to_string(),
                    output,
                });
                self.current.as_ref()
            }
            Err(e) => {
                warn!("GPU duplication of {} unavailable: {}", target, e);
                self.faults.insert(target);
                None
            }
        }
    }

    /// Polls the current handle for a frame
    pub fn acquire_frame(&mut self, cursor: Option<&mut CursorCompositor>) -> CaptureResult {
        self.drain_signal();

        let handle = match self.current.as_mut() {
            Some(handle) => handle,
            None => return CaptureResult::failed("No GPU duplication is active", None),
        };

        handle.output.release_frame();

        let raw = match handle.output.acquire_frame() {
            Ok(AcquireOutcome::NoChanges) => return CaptureResult::NoChanges,
            Ok(AcquireOutcome::Frame(raw)) => raw,
            Err(err) => {
                return match FrameErrorPolicy::classify(err.code) {
                    FrameErrorAction::NoChanges => CaptureResult::NoChanges,
                    FrameErrorAction::Fault => {
                        warn!(
                            "GPU capture of {} failed: {:#010x} from {}",
                            handle.target, err.code, err.context
                        );
                        self.set_faulted();
                        CaptureResult::failed("GPU frame acquisition failed", Some(err.into()))
                    }
                };
            }
        };

        let correction = handle.output.rotation().correction();
        let (texture_width, texture_height) = (raw.bitmap.width() as i32, raw.bitmap.height() as i32);
        let mut bitmap = if correction == Rotation::Identity {
            raw.bitmap
        } else {
            raw.bitmap.rotated(correction)
        };

        let mut dirty: Vec<Rect> = raw
            .dirty_rects
            .iter()
            .map(|r| r.rotate_within(correction, texture_width, texture_height))
            .collect();

        // The texture never contains the pointer, so wherever it was last
        // composited (by either backend) must be repainted
        if let Some(cursor) = cursor {
            let area = handle.output.bounds();
            dirty.push(cursor.previous_rect(area));
            dirty.push(cursor.draw(&mut bitmap, area));
        }

        let dirty = clip_dirty_rects(dirty, bitmap.bounds());

        CaptureResult::Frame(CapturedFrame {
            bitmap,
            dirty_rects: DirtyRects::Partial(dirty),
            is_using_gpu: true,
        })
    }

    /// Disposes the current handle; the target stays usable
    pub fn release(&mut self) {
        if let Some(handle) = self.current.take() {
            debug!("Released GPU duplication of {}", handle.target);
        }
    }

    /// Faults the current target and disposes its handle
    pub fn set_faulted(&mut self) {
        if let Some(handle) = self.current.take() {
            self.faults.insert(&handle.target);
            info!("GPU duplication of {} disposed after a fault", handle.target);
        }
    }
}

/// Clips rectangles to `bounds`, dropping empty and repeated ones
fn clip_dirty_rects(rects: Vec<Rect>, bounds: Rect) -> Vec<Rect> {
    let mut clipped: Vec<Rect> = Vec::with_capacity(rects.len());
    for rect in rects {
        let rect = rect.intersect(&bounds);
        if !rect.is_empty() && !clipped.contains(&rect) {
            clipped.push(rect);
        }
    }
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::cursor::{CursorShape, CursorSource, CursorState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Script = Arc<Mutex<VecDeque<Result<AcquireOutcome, FrameError>>>>;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        dropped: AtomicUsize,
        events: Mutex<Vec<String>>,
    }

    struct MockOutput {
        name: String,
        bounds: Rect,
        rotation: Rotation,
        script: Script,
        counters: Arc<Counters>,
    }

    impl Drop for MockOutput {
        fn drop(&mut self) {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            self.counters.events.lock().unwrap().push(format!("drop {}", self.name));
        }
    }

    impl DuplicatedOutput for MockOutput {
        fn bounds(&self) -> Rect {
            self.bounds
        }

        fn rotation(&self) -> Rotation {
            self.rotation
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

    struct MockApi {
        counters: Arc<Counters>,
        script: Script,
        rotation: Rotation,
        fail: bool,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                counters: Arc::default(),
                script: Arc::default(),
                rotation: Rotation::Identity,
                fail: false,
            }
        }
    }

    impl DuplicationApi for MockApi {
        type Output = MockOutput;

        fn open_output(&mut self, device_name: &str) -> Result<MockOutput, CaptureError> {
            if self.fail {
                return Err(CaptureError::GpuUnsupported);
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            self.counters.events.lock().unwrap().push(format!("open {}", device_name));
            Ok(MockOutput {
                name: device_name.to_string(),
                bounds: Rect::new(0, 0, 100, 50),
                rotation: self.rotation,
                script: Arc::clone(&self.script),
                counters: Arc::clone(&self.counters),
            })
        }
    }

    fn frame(width: u32, height: u32, dirty: Vec<Rect>) -> Result<AcquireOutcome, FrameError> {
        Ok(AcquireOutcome::Frame(RawFrame {
            bitmap: Bitmap::new(width, height),
            dirty_rects: dirty,
        }))
    }

    fn backend(api: MockApi) -> GpuBackend<MockApi> {
        GpuBackend::new(api, FaultCache::new(Duration::from_secs(10)))
    }

    #[test]
    fn test_duplicate_output_is_idempotent() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        let mut gpu = backend(api);

        assert!(gpu.duplicate_output("A").is_some());
        assert!(gpu.duplicate_output("A").is_some());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_switching_target_releases_before_creating() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        let mut gpu = backend(api);

        gpu.duplicate_output("A");
        gpu.duplicate_output("B");

        assert_eq!(
            *counters.events.lock().unwrap(),
            vec!["open A".to_string(), "drop A".to_string(), "open B".to_string()]
        );
        assert_eq!(gpu.current().unwrap().target(), "B");
    }

    #[test]
    fn test_open_failure_faults_target() {
        let mut api = MockApi::new();
        api.fail = true;
        let mut gpu = backend(api);

        assert!(gpu.duplicate_output("A").is_none());
        assert!(gpu.is_faulted("A"));
    }

    #[test]
    fn test_faulted_target_makes_no_gpu_call() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        let mut gpu = backend(api);

        gpu.duplicate_output("A");
        gpu.set_faulted();
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);

        assert!(gpu.duplicate_output("A").is_none());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_signal_is_drained_before_acquire() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        let mut gpu = backend(api);
        gpu.duplicate_output("A");

        let signal = gpu.fault_signal();
        std::thread::spawn(move || signal.raise()).join().unwrap();

        assert!(matches!(gpu.acquire_frame(None), CaptureResult::Failed(_)));
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        assert!(gpu.is_faulted("A"));
    }

    #[test]
    fn test_no_accumulated_frames_is_no_changes() {
        let api = MockApi::new();
        let mut gpu = backend(api);
        gpu.duplicate_output("A");
        assert!(matches!(gpu.acquire_frame(None), CaptureResult::NoChanges));
    }

    #[test]
    fn test_wait_timeout_is_no_changes() {
        let api = MockApi::new();
        api.script.lock().unwrap().push_back(Err(FrameError {
            context: "AcquireNextFrame",
            code: WAIT_TIMEOUT_CODE,
        }));
        let mut gpu = backend(api);
        gpu.duplicate_output("A");

        assert!(matches!(gpu.acquire_frame(None), CaptureResult::NoChanges));
        assert!(gpu.current().is_some());
    }

    #[test]
    fn test_device_removed_faults_and_disposes() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        api.script.lock().unwrap().push_back(Err(FrameError {
            context: "AcquireNextFrame",
            code: DEVICE_REMOVED_CODE,
        }));
        let mut gpu = backend(api);
        gpu.duplicate_output("A");

        match gpu.acquire_frame(None) {
            CaptureResult::Failed(failure) => assert_eq!(
                failure.error,
                Some(CaptureError::Os {
                    context: "AcquireNextFrame",
                    code: DEVICE_REMOVED_CODE
                })
            ),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(gpu.current().is_none());
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
        assert!(gpu.duplicate_output("A").is_none());
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(FrameErrorPolicy::classify(WAIT_TIMEOUT_CODE), FrameErrorAction::NoChanges);
        assert_eq!(FrameErrorPolicy::classify(ACCESS_LOST_CODE), FrameErrorAction::Fault);
        assert_eq!(FrameErrorPolicy::classify(ACCESS_DENIED_CODE), FrameErrorAction::Fault);
        assert_eq!(FrameErrorPolicy::classify(0x8000_4005), FrameErrorAction::Fault);
    }

    #[test]
    fn test_dirty_rects_are_clipped_to_bounds() {
        let api = MockApi::new();
        api.script.lock().unwrap().push_back(frame(
            100,
            50,
            vec![Rect::new(90, 40, 30, 30), Rect::new(200, 200, 5, 5), Rect::new(0, 0, 10, 10)],
        ));
        let mut gpu = backend(api);
        gpu.duplicate_output("A");

        let result = gpu.acquire_frame(None);
        let frame = result.frame().unwrap();
        assert!(frame.is_using_gpu);
        assert_eq!(
            frame.dirty_rects,
            DirtyRects::Partial(vec![Rect::new(90, 40, 10, 10), Rect::new(0, 0, 10, 10)])
        );
    }

    #[test]
    fn test_rotated_output_is_corrected() {
        let mut api = MockApi::new();
        api.rotation = Rotation::Rotate90;
        // A portrait display duplicated as a landscape texture
        api.script
            .lock()
            .unwrap()
            .push_back(frame(100, 50, vec![Rect::new(0, 0, 10, 5)]));
        let mut gpu = backend(api);
        gpu.duplicate_output("A");

        let result = gpu.acquire_frame(None);
        let frame = result.frame().unwrap();
        assert_eq!((frame.bitmap.width(), frame.bitmap.height()), (50, 100));
        assert_eq!(
            frame.dirty_rects,
            DirtyRects::Partial(vec![Rect::new(0, 90, 5, 10)])
        );
    }

    struct MovingCursor(Vec<(i32, i32)>);

    impl CursorSource for MovingCursor {
        fn query(&mut self) -> Option<CursorState> {
            let (x, y) = if self.0.len() > 1 { self.0.remove(0) } else { self.0[0] };
            Some(CursorState {
                visible: true,
                x,
                y,
                kind: Default::default(),
                shape: Some(Arc::new(CursorShape {
                    image: Bitmap::filled(4, 4, [255, 255, 255, 255]),
                    hotspot_x: 0,
                    hotspot_y: 0,
                })),
            })
        }
    }

    #[test]
    fn test_cursor_rects_extend_dirty_rects() {
        let api = MockApi::new();
        {
            let mut script = api.script.lock().unwrap();
            script.push_back(frame(100, 50, vec![]));
            script.push_back(frame(100, 50, vec![]));
        }
        let mut gpu = backend(api);
        let mut cursor = CursorCompositor::new(Box::new(MovingCursor(vec![(10, 10), (20, 20)])));
        gpu.duplicate_output("A");

        let first = gpu.acquire_frame(Some(&mut cursor));
        assert_eq!(
            first.frame().unwrap().dirty_rects,
            DirtyRects::Partial(vec![Rect::new(10, 10, 4, 4)])
        );

        let second = gpu.acquire_frame(Some(&mut cursor));
        assert_eq!(
            second.frame().unwrap().dirty_rects,
            DirtyRects::Partial(vec![Rect::new(10, 10, 4, 4), Rect::new(20, 20, 4, 4)])
        );
        assert_eq!(cursor.previous_rect(Rect::new(0, 0, 100, 50)), Rect::new(20, 20, 4, 4));
    }

    #[test]
    fn test_still_cursor_is_reported_once() {
        let api = MockApi::new();
        {
            let mut script = api.script.lock().unwrap();
            script.push_back(frame(100, 50, vec![]));
            script.push_back(frame(100, 50, vec![Rect::new(10, 10, 4, 4)]));
        }
        let mut gpu = backend(api);
        let mut cursor = CursorCompositor::new(Box::new(MovingCursor(vec![(10, 10)])));
        gpu.duplicate_output("A");

        gpu.acquire_frame(Some(&mut cursor));
        let second = gpu.acquire_frame(Some(&mut cursor));
        assert_eq!(
            second.frame().unwrap().dirty_rects,
            DirtyRects::Partial(vec![Rect::new(10, 10, 4, 4)])
        );
    }

    #[test]
    fn test_release_keeps_target_usable() {
        let api = MockApi::new();
        let counters = Arc::clone(&api.counters);
        let mut gpu = backend(api);

        gpu.duplicate_output("A");
        gpu.release();
        assert!(gpu.current().is_none());
        assert!(!gpu.is_faulted("A"));
        assert!(gpu.duplicate_output("A").is_some());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsupported_api_always_faults() {
        let mut gpu = GpuBackend::new(UnsupportedDuplication, FaultCache::default());
        assert!(gpu.duplicate_output("A").is_none());
        assert!(gpu.is_faulted("A"));
        assert!(matches!(gpu.acquire_frame(None), CaptureResult::Failed(_)));
    }

    #[test]
    fn test_access_lost_maps_to_capture_error() {
        let err: CaptureError = FrameError {
            context: "AcquireNextFrame",
            code: ACCESS_LOST_CODE,
        }
        .into();
        assert_eq!(err, CaptureError::AccessLost);
    }
}
