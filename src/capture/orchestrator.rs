//! Per-call choice between the GPU and fallback backends

use std::sync::Arc;

use tracing::trace;

use crate::capture::cursor::{CursorCompositor, CursorKind};
use crate::capture::desktop::{default_input_desktop, InputDesktop};
use crate::capture::display::DisplayRegistry;
use crate::capture::failure_log::FailureLog;
use crate::capture::fallback::FallbackBackend;
use crate::capture::fault::{FaultCache, FaultSignal};
use crate::capture::gpu::{gpu_capture_supported, DuplicationApi, GpuBackend, SystemDuplication};
use crate::capture::types::{CaptureResult, DirtyRects, DisplayInfo};
use crate::config::CaptureSettings;

/// Next step after the GPU attempt
#[derive(Debug)]
enum Decision {
    Return(CaptureResult),
    Fallback,
}

/// The GPU-vs-fallback decision table
///
/// | GPU result              | force_key_frame | next                |
/// |-------------------------|-----------------|---------------------|
/// | unavailable             | any             | fallback            |
/// | frame                   | false           | return frame        |
/// | frame                   | true            | return as full frame|
/// | no changes              | false           | return no changes   |
/// | no changes              | true            | fallback            |
/// | failed                  | any             | fallback            |
fn decide(gpu: Option<CaptureResult>, force_key_frame: bool) -> Decision {
    match gpu {
        None | Some(CaptureResult::Failed(_)) => Decision::Fallback,
        Some(CaptureResult::NoChanges) if force_key_frame => Decision::Fallback,
        Some(CaptureResult::NoChanges) => Decision::Return(CaptureResult::NoChanges),
        Some(CaptureResult::Frame(mut frame)) => {
            if force_key_frame {
                frame.dirty_rects = DirtyRects::Full;
            }
            Decision::Return(CaptureResult::Frame(frame))
        }
    }
}

/// Captures displays through whichever backend currently works
pub struct CaptureOrchestrator<A: DuplicationApi = SystemDuplication> {
    registry: Arc<DisplayRegistry>,
    gpu: Option<GpuBackend<A>>,
    fallback: FallbackBackend,
    cursor: CursorCompositor,
    desktop: Box<dyn InputDesktop>,
    desktop_log: FailureLog,
}

impl CaptureOrchestrator<SystemDuplication> {
    /// Builds an orchestrator over the platform backends
    pub fn system(registry: Arc<DisplayRegistry>, settings: &CaptureSettings) -> Self {
        let gpu = (settings.prefer_gpu && gpu_capture_supported())
            .then(|| GpuBackend::new(SystemDuplication::default(), FaultCache::new(settings.fault_ttl())));

        Self::new(
            registry,
            gpu,
            FallbackBackend::system(),
            CursorCompositor::system(),
            default_input_desktop(),
        )
    }
}

impl<A: DuplicationApi> CaptureOrchestrator<A> {
    /// Builds an orchestrator from explicit parts
    pub fn new(
        registry: Arc<DisplayRegistry>,
        gpu: Option<GpuBackend<A>>,
        fallback: FallbackBackend,
        cursor: CursorCompositor,
        desktop: Box<dyn InputDesktop>,
    ) -> Self {
        Self {
            registry,
            gpu,
            fallback,
            cursor,
            desktop,
            desktop_log: FailureLog::with_default_interval("Input desktop switch"),
        }
    }

    /// Display registry this orchestrator captures from
    pub fn registry(&self) -> &Arc<DisplayRegistry> {
        &self.registry
    }

    /// Signal that faults the current GPU target from another thread
    pub fn fault_signal(&self) -> Option<FaultSignal> {
        self.gpu.as_ref().map(GpuBackend::fault_signal)
    }

    /// Drops the current GPU duplication without faulting its target
    ///
    /// The next capture duplicates the output again, picking up new bounds
    /// and orientation.
    pub fn release_gpu(&mut self) {
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.release();
        }
    }

    /// Returns the pointer kind if it changed since the last query
    pub fn poll_cursor_kind(&mut self) -> Option<CursorKind> {
        self.cursor.poll_kind_change()
    }

    fn attach_input_desktop(&mut self) {
        let outcome = self.desktop.switch_to_input_desktop();
        self.desktop_log.record(&outcome);
    }

    /// Captures one display
    ///
    /// Never fails outright; failures come back as `CaptureResult::Failed`.
    pub fn capture_display(
        &mut self,
        target: &DisplayInfo,
        capture_cursor: bool,
        force_key_frame: bool,
    ) -> CaptureResult {
        self.attach_input_desktop();

        let gpu_result = match self.gpu.as_mut() {
            Some(gpu) => {
                let available = gpu.duplicate_output(&target.device_name).is_some();
                available.then(|| gpu.acquire_frame(capture_cursor.then_some(&mut self.cursor)))
            }
            None => None,
        };

        match decide(gpu_result, force_key_frame) {
            Decision::Return(result) => result,
            Decision::Fallback => {
                trace!("Using fallback capture for {}", target.device_name);
                let cursor = capture_cursor.then_some(&mut self.cursor);
                self.fallback.capture_region(target.monitor_area, cursor)
            }
        }
    }

    /// Captures the whole virtual desktop through the fallback backend
    pub fn capture_all_displays(&mut self, capture_cursor: bool) -> CaptureResult {
        self.attach_input_desktop();

        let bounds = self.registry.virtual_screen_bounds();
        let cursor = capture_cursor.then_some(&mut self.cursor);
        self.fallback.capture_region(bounds, cursor)
    }
}
