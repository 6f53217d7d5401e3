//! Display enumeration and caching
//!
//! `DisplayRegistry` keeps one immutable snapshot of the attached monitors.
//! The snapshot is built lazily and replaced wholesale on reload. A failed
//! enumeration is never cached, so the next read tries again. Every read or
//! rebuild happens under the same mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::capture::failure_log::FailureLog;
use crate::capture::types::{DisplayInfo, Rect};
use crate::error::CaptureError;

/// Source of monitor information
pub trait DisplaySource: Send + Sync {
    /// Enumerates the currently attached monitors
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError>;
}

struct RegistryState {
    snapshot: Option<Arc<[DisplayInfo]>>,
    failures: FailureLog,
}

/// Cached view of the attached monitors
pub struct DisplayRegistry {
    source: Box<dyn DisplaySource>,
    state: Mutex<RegistryState>,
}

impl DisplayRegistry {
    /// Creates a registry over the given source; nothing is enumerated yet
    pub fn new(source: Box<dyn DisplaySource>) -> Self {
        Self {
            source,
            state: Mutex::new(RegistryState {
                snapshot: None,
                failures: FailureLog::with_default_interval("Display enumeration"),
            }),
        }
    }

    /// Creates a registry over the platform display source
    pub fn system() -> Self {
        Self::new(default_display_source())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // The guarded value is a plain snapshot, so a poisoned lock is still usable
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enumerate(&self, state: &mut RegistryState) -> Option<Arc<[DisplayInfo]>> {
        let outcome = self.source.enumerate();
        state.failures.record(&outcome);
        let displays = outcome.ok()?;
        debug!("Enumerated {} display(s)", displays.len());
        Some(displays.into())
    }

    /// Returns the cached snapshot, enumerating if there is none
    ///
    /// Returns an empty set while enumeration keeps failing.
    pub fn displays(&self) -> Arc<[DisplayInfo]> {
        let mut state = self.lock();
        if let Some(snapshot) = state.snapshot.as_ref() {
            return Arc::clone(snapshot);
        }
        match self.enumerate(&mut state) {
            Some(snapshot) => {
                state.snapshot = Some(Arc::clone(&snapshot));
                snapshot
            }
            None => Arc::from(Vec::new()),
        }
    }

    /// Rebuilds the snapshot
    ///
    /// On failure the cache is dropped, so the next read enumerates again.
    pub fn reload_displays(&self) -> Arc<[DisplayInfo]> {
        let mut state = self.lock();
        match self.enumerate(&mut state) {
            Some(snapshot) => {
                info!("Display configuration reloaded ({} display(s))", snapshot.len());
                state.snapshot = Some(Arc::clone(&snapshot));
                snapshot
            }
            None => {
                state.snapshot = None;
                Arc::from(Vec::new())
            }
        }
    }

    /// Enumerates again and returns the new snapshot if it differs
    ///
    /// A failed enumeration keeps the current snapshot.
    pub fn refresh(&self) -> Option<Arc<[DisplayInfo]>> {
        let mut state = self.lock();
        let fresh = self.enumerate(&mut state)?;
        if state.snapshot.as_deref() == Some(&*fresh) {
            return None;
        }
        info!("Display configuration changed ({} display(s))", fresh.len());
        state.snapshot = Some(Arc::clone(&fresh));
        Some(fresh)
    }

    /// Looks up a display by device name
    pub fn try_find_display(&self, device_name: &str) -> Option<DisplayInfo> {
        self.displays()
            .iter()
            .find(|d| d.device_name == device_name)
            .cloned()
    }

    /// Returns the primary display, or the first one if none is flagged
    pub fn primary_display(&self) -> Option<DisplayInfo> {
        primary_of(&self.displays())
    }

    /// Returns the bounding box of every monitor
    pub fn virtual_screen_bounds(&self) -> Rect {
        let displays = self.displays();
        Rect::union_all(displays.iter().map(|d| &d.monitor_area))
    }
}

/// Primary display of a set, or the first one if none is flagged
pub fn primary_of(displays: &[DisplayInfo]) -> Option<DisplayInfo> {
    displays
        .iter()
        .find(|d| d.is_primary)
        .or_else(|| displays.first())
        .cloned()
}

/// Converts a position given as fractions of a display to absolute
/// virtual-desktop coordinates
pub fn convert_percentage_to_absolute(display: &DisplayInfo, percent_x: f64, percent_y: f64) -> (i32, i32) {
    let area = display.monitor_area;
    let x = area.width as f64 * percent_x + area.x as f64;
    let y = area.height as f64 * percent_y + area.y as f64;
    (x as i32, y as i32)
}

/// Fixed list of displays, replaceable at runtime
///
/// Used for headless hosts and tests.
#[derive(Default)]
pub struct StaticDisplaySource {
    displays: Mutex<Vec<DisplayInfo>>,
}

impl StaticDisplaySource {
    /// Creates a source that always reports `displays`
    pub fn new(displays: Vec<DisplayInfo>) -> Self {
        Self {
            displays: Mutex::new(displays),
        }
    }

    /// Replaces the reported displays
    pub fn set(&self, displays: Vec<DisplayInfo>) {
        *self
            .displays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = displays;
    }
}

impl DisplaySource for StaticDisplaySource {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        Ok(self
            .displays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

impl<T: DisplaySource + ?Sized> DisplaySource for Arc<T> {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        (**self).enumerate()
    }
}

/// Monitors reported by xcap
#[cfg(feature = "xcap")]
pub struct XcapDisplaySource;

#[cfg(feature = "xcap")]
impl DisplaySource for XcapDisplaySource {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        use crate::capture::types::Rotation;

        let monitors = xcap::Monitor::all()
            .map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?;

        let mut displays = Vec::with_capacity(monitors.len());
        for (index, monitor) in monitors.iter().enumerate() {
            let name = monitor
                .name()
                .unwrap_or_else(|_| format!("Display {}", index));
            let area = Rect::new(
                monitor.x().unwrap_or(0),
                monitor.y().unwrap_or(0),
                monitor.width().unwrap_or(0) as i32,
                monitor.height().unwrap_or(0) as i32,
            );

            displays.push(DisplayInfo {
                display_name: name.clone(),
                device_name: name,
                monitor_area: area,
                is_primary: monitor.is_primary().unwrap_or(index == 0),
                rotation: Rotation::from_degrees(monitor.rotation().unwrap_or(0.0)),
                scale_factor: monitor.scale_factor().unwrap_or(1.0) as f64,
            });
        }

        Ok(displays)
    }
}

/// Returns the display source for this build
///
/// Windows reports GDI device names through DXGI so they match the names
/// the GPU backend duplicates.
pub fn default_display_source() -> Box<dyn DisplaySource> {
    #[cfg(windows)]
    {
        Box::new(crate::capture::gpu::dxgi::DxgiDisplaySource)
    }
    #[cfg(all(not(windows), feature = "xcap"))]
    {
        Box::new(XcapDisplaySource)
    }
    #[cfg(all(not(windows), not(feature = "xcap")))]
    {
        tracing::warn!("Built without xcap; no displays will be reported");
        Box::new(StaticDisplaySource::default())
    }
}
