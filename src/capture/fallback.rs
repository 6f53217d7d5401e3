//! Software capture of the composited screen

use tracing::{debug, warn};

use crate::capture::cursor::CursorCompositor;
use crate::capture::types::{Bitmap, CaptureResult, CapturedFrame, DirtyRects, Rect};
use crate::error::CaptureError;

/// Copies pixels of the composited desktop
pub trait ScreenCopier: Send {
    /// Returns a bitmap exactly covering `area` (virtual-desktop coordinates)
    fn copy_area(&mut self, area: Rect) -> Result<Bitmap, CaptureError>;
}

/// Whole-rectangle capture backend
pub struct FallbackBackend {
    copier: Box<dyn ScreenCopier>,
}

impl FallbackBackend {
    /// Creates a backend over the given copier
    pub fn new(copier: Box<dyn ScreenCopier>) -> Self {
        Self { copier }
    }

    /// Creates a backend over the platform screen copier
    pub fn system() -> Self {
        Self::new(default_screen_copier())
    }

    /// Captures `area`, reporting all of it as dirty
    pub fn capture_region(&mut self, area: Rect, cursor: Option<&mut CursorCompositor>) -> CaptureResult {
        if area.is_empty() {
            return CaptureResult::failed(
                "Capture area is empty",
                Some(CaptureError::InvalidArea(area.to_string())),
            );
        }

        let mut bitmap = match self.copier.copy_area(area) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                warn!("Screen copy of {} failed: {}", area, e);
                return CaptureResult::failed("Screen copy failed", Some(e));
            }
        };

        if bitmap.width() as i32 != area.width || bitmap.height() as i32 != area.height {
            return CaptureResult::failed(
                "Screen copy returned the wrong size",
                Some(CaptureError::ScreenCopyFailed(format!(
                    "expected {}x{}, got {}x{}",
                    area.width,
                    area.height,
                    bitmap.width(),
                    bitmap.height()
                ))),
            );
        }

        if let Some(cursor) = cursor {
            cursor.draw(&mut bitmap, area);
        }

        debug!("Copied {} from the composited screen", area);
        CaptureResult::Frame(CapturedFrame {
            bitmap,
            dirty_rects: DirtyRects::Full,
            is_using_gpu: false,
        })
    }
}

/// Composes xcap monitor captures onto a canvas covering the area
#[cfg(feature = "xcap")]
#[derive(Debug, Default)]
pub struct XcapScreenCopier;

#[cfg(feature = "xcap")]
impl ScreenCopier for XcapScreenCopier {
    fn copy_area(&mut self, area: Rect) -> Result<Bitmap, CaptureError> {
        use image::imageops::{self, FilterType};

        let monitors =
            xcap::Monitor::all().map_err(|e| CaptureError::EnumerationFailed(e.to_string()))?;
        let mut canvas = Bitmap::new(area.width as u32, area.height as u32);
        let mut covered = false;

        for monitor in monitors {
            let bounds = Rect::new(
                monitor.x().unwrap_or(0),
                monitor.y().unwrap_or(0),
                monitor.width().unwrap_or(0) as i32,
                monitor.height().unwrap_or(0) as i32,
            );
            if bounds.intersect(&area).is_empty() {
                continue;
            }

            let mut image = monitor
                .capture_image()
                .map_err(|e| CaptureError::ScreenCopyFailed(e.to_string()))?;
            // HiDPI monitors capture at physical resolution
            if image.width() as i32 != bounds.width || image.height() as i32 != bounds.height {
                image = imageops::resize(&image, bounds.width as u32, bounds.height as u32, FilterType::Triangle);
            }

            let pixels = Bitmap::from_rgba_image(&image);
            canvas.blit(&pixels, bounds.x - area.x, bounds.y - area.y);
            covered = true;
        }

        if !covered {
            return Err(CaptureError::InvalidArea(format!("{} is not on any monitor", area)));
        }
        Ok(canvas)
    }
}

/// Copier for builds without a screen capture library
#[derive(Debug, Default)]
pub struct UnavailableScreenCopier;

impl ScreenCopier for UnavailableScreenCopier {
    fn copy_area(&mut self, _area: Rect) -> Result<Bitmap, CaptureError> {
        Err(CaptureError::ScreenCopyFailed(
            "no screen capture library in this build".to_string(),
        ))
    }
}

/// Returns the screen copier for this build
pub fn default_screen_copier() -> Box<dyn ScreenCopier> {
    #[cfg(feature = "xcap")]
    {
        Box::new(XcapScreenCopier)
    }
    #[cfg(not(feature = "xcap"))]
    {
        Box::new(UnavailableScreenCopier)
    }
}
