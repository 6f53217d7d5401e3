//! Viewer-side surface
//!
//! The surface spans the union of the host's display bounds. Each region is
//! decoded and copied at its offset from the surface origin; nothing else is
//! redrawn.

use std::path::Path;

use image::ImageFormat;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{Bitmap, CursorKind, Rect};
use crate::codec::decode_image;
use crate::error::{CodecError, CodecResult};
use crate::protocol::{CursorChangedDto, DisplayDataDto, DisplayDto, ScreenRegionDto};

const OPAQUE_BLACK: [u8; 4] = [0, 0, 0, 255];

/// Largest surface a display set may ask for (16384 x 8192, 512 MiB of BGRA)
pub const MAX_SURFACE_PIXELS: u64 = 16384 * 8192;

/// Paints region payloads onto a virtual-desktop surface
#[derive(Debug)]
pub struct RegionRenderer {
    surface: Option<Bitmap>,
    origin: Rect,
    displays: Vec<DisplayDto>,
    selected: Option<String>,
    session_id: Option<Uuid>,
    cursor: CursorKind,
    regions_applied: u64,
    max_pixels: u64,
}

impl Default for RegionRenderer {
    fn default() -> Self {
        Self::with_pixel_limit(MAX_SURFACE_PIXELS)
    }
}

impl RegionRenderer {
    /// Creates a renderer with no surface
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a renderer that refuses surfaces above `max_pixels`
    pub fn with_pixel_limit(max_pixels: u64) -> Self {
        Self {
            surface: None,
            origin: Rect::EMPTY,
            displays: Vec::new(),
            selected: None,
            session_id: None,
            cursor: CursorKind::default(),
            regions_applied: 0,
            max_pixels,
        }
    }

    fn surface_bounds_for(&self, displays: &[DisplayDto]) -> CodecResult<Rect> {
        let mut bounds = Rect::EMPTY;
        for display in displays {
            if display.bounds.is_empty() || !display.bounds.is_representable() {
                return Err(CodecError::InvalidDisplaySet(format!(
                    "{} has bounds {}",
                    display.device_name, display.bounds
                )));
            }
            bounds = bounds.checked_union(&display.bounds).ok_or_else(|| {
                CodecError::InvalidDisplaySet(format!(
                    "{} at {} overflows the virtual desktop",
                    display.device_name, display.bounds
                ))
            })?;
        }

        let pixels = bounds.area() as u64;
        if pixels > self.max_pixels {
            return Err(CodecError::InvalidDisplaySet(format!(
                "surface {} has {} pixels, limit is {}",
                bounds, pixels, self.max_pixels
            )));
        }
        Ok(bounds)
    }

    /// Replaces the display set and reallocates the surface
    ///
    /// # Errors
    ///
    /// Returns `InvalidDisplaySet` for empty or overflowing bounds and for
    /// surfaces above the pixel limit; the current surface is kept.
    pub fn apply_display_data(&mut self, data: &DisplayDataDto) -> CodecResult<()> {
        let bounds = self.surface_bounds_for(&data.displays)?;

        self.session_id = Some(data.session_id);
        self.displays = data.displays.clone();
        self.selected = self
            .displays
            .iter()
            .find(|d| d.is_primary)
            .or_else(|| self.displays.first())
            .map(|d| d.device_name.clone());

        self.origin = bounds;
        if self.origin.is_empty() {
            warn!("Host reported no displays");
            self.surface = None;
            return Ok(());
        }

        self.surface = Some(Bitmap::filled(
            self.origin.width as u32,
            self.origin.height as u32,
            OPAQUE_BLACK,
        ));
        info!(
            "Surface {} for {} display(s), selected {:?}",
            self.origin,
            self.displays.len(),
            self.selected
        );
        Ok(())
    }

    /// Decodes one region and copies it onto the surface
    ///
    /// Returns the surface rectangle written, relative to the surface origin.
    ///
    /// # Errors
    ///
    /// Returns `NoSurface` before the first display set, and a decode error
    /// if the image is unreadable or its size disagrees with the region.
    pub fn apply_region(&mut self, region: &ScreenRegionDto) -> CodecResult<Rect> {
        let surface = self.surface.as_mut().ok_or(CodecError::NoSurface)?;

        let bitmap = decode_image(&region.encoded_image)?;
        if bitmap.width() as i32 != region.width || bitmap.height() as i32 != region.height {
            return Err(CodecError::InvalidBitmap(format!(
                "region {} decoded to {}x{}",
                region.area(),
                bitmap.width(),
                bitmap.height()
            )));
        }

        let target = region
            .x
            .checked_sub(self.origin.x)
            .zip(region.y.checked_sub(self.origin.y))
            .map(|(x, y)| Rect::new(x, y, region.width, region.height))
            .filter(Rect::is_representable)
            .ok_or_else(|| CodecError::RegionOutOfBounds(region.area().to_string()))?;

        let written = surface.blit(&bitmap, target.x, target.y);
        if written.is_empty() {
            debug!("Region {} lies outside the surface", region.area());
        }
        self.regions_applied += 1;
        Ok(written)
    }

    /// Records a pointer shape change
    pub fn apply_cursor(&mut self, change: &CursorChangedDto) {
        self.cursor = change.cursor;
    }

    /// Current surface, if a display set has arrived
    pub fn snapshot(&self) -> Option<&Bitmap> {
        self.surface.as_ref()
    }

    /// Virtual-desktop bounds the surface covers
    pub fn surface_bounds(&self) -> Rect {
        self.origin
    }

    /// Writes the surface as PNG
    ///
    /// # Errors
    ///
    /// Returns `NoSurface` if nothing has been rendered, or an encode error
    pub fn save_png(&self, path: &Path) -> CodecResult<()> {
        let surface = self.surface.as_ref().ok_or(CodecError::NoSurface)?;
        surface
            .to_rgba_image()
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| CodecError::EncodeFailed(e.to_string()))?;
        info!("Saved {}x{} snapshot to {:?}", surface.width(), surface.height(), path);
        Ok(())
    }

    /// Displays from the last display set
    pub fn displays(&self) -> &[DisplayDto] {
        &self.displays
    }

    /// Display the viewer considers selected
    pub fn selected_display(&self) -> Option<&DisplayDto> {
        let selected = self.selected.as_deref()?;
        self.displays.iter().find(|d| d.device_name == selected)
    }

    /// Marks a display as selected; returns false if it is unknown
    pub fn select_display(&mut self, device_name: &str) -> bool {
        let known = self.displays.iter().any(|d| d.device_name == device_name);
        if known {
            self.selected = Some(device_name.to_string());
        }
        known
    }

    /// Session id from the last display set
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Last reported pointer shape
    pub fn cursor(&self) -> CursorKind {
        self.cursor
    }

    /// Number of regions painted
    pub fn regions_applied(&self) -> u64 {
        self.regions_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Rotation;
    use crate::codec::RegionEncoder;
    use tempfile::TempDir;

    fn display(name: &str, bounds: Rect, is_primary: bool) -> DisplayDto {
        DisplayDto {
            device_name: name.to_string(),
            display_name: name.to_string(),
            bounds,
            is_primary,
            rotation: Rotation::Identity,
            scale_factor: 1.0,
        }
    }

    fn two_displays() -> DisplayDataDto {
        DisplayDataDto {
            session_id: Uuid::new_v4(),
            displays: vec![
                display("left", Rect::new(-40, 0, 40, 30), false),
                display("main", Rect::new(0, 0, 60, 40), true),
            ],
        }
    }

    fn region(x: i32, y: i32, bitmap: &Bitmap) -> ScreenRegionDto {
        ScreenRegionDto {
            session_id: Uuid::nil(),
            x,
            y,
            width: bitmap.width() as i32,
            height: bitmap.height() as i32,
            encoded_image: RegionEncoder::png().encode(bitmap).unwrap(),
        }
    }

    #[test]
    fn test_surface_spans_union_and_selects_primary() {
        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&two_displays()).unwrap();

        assert_eq!(renderer.surface_bounds(), Rect::new(-40, 0, 100, 40));
        let surface = renderer.snapshot().unwrap();
        assert_eq!((surface.width(), surface.height()), (100, 40));
        assert_eq!(renderer.selected_display().unwrap().device_name, "main");
    }

    #[test]
    fn test_first_display_selected_without_primary() {
        let mut data = two_displays();
        data.displays[1].is_primary = false;

        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&data).unwrap();
        assert_eq!(renderer.selected_display().unwrap().device_name, "left");
        assert!(renderer.select_display("main"));
        assert!(!renderer.select_display("missing"));
    }

    #[test]
    fn test_region_blits_relative_to_origin() {
        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&two_displays()).unwrap();

        let red = Bitmap::filled(4, 3, [0, 0, 255, 255]);
        let written = renderer.apply_region(&region(-40, 2, &red)).unwrap();
        assert_eq!(written, Rect::new(0, 2, 4, 3));

        let surface = renderer.snapshot().unwrap();
        assert_eq!(surface.pixel(0, 2), Some([0, 0, 255, 255]));
        assert_eq!(surface.pixel(3, 4), Some([0, 0, 255, 255]));
        assert_eq!(surface.pixel(4, 2), Some(OPAQUE_BLACK));
        assert_eq!(renderer.regions_applied(), 1);
    }

    #[test]
    fn test_region_before_display_data_is_rejected() {
        let mut renderer = RegionRenderer::new();
        let err = renderer
            .apply_region(&region(0, 0, &Bitmap::filled(1, 1, OPAQUE_BLACK)))
            .unwrap_err();
        assert!(matches!(err, CodecError::NoSurface));
    }

    #[test]
    fn test_region_size_mismatch_is_rejected() {
        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&two_displays()).unwrap();

        let mut dto = region(0, 0, &Bitmap::filled(2, 2, OPAQUE_BLACK));
        dto.width = 3;
        assert!(matches!(
            renderer.apply_region(&dto),
            Err(CodecError::InvalidBitmap(_))
        ));
    }

    #[test]
    fn test_overflowing_display_bounds_keep_current_surface() {
        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&two_displays()).unwrap();
        let session_id = renderer.session_id();

        let hostile = DisplayDataDto {
            session_id: Uuid::new_v4(),
            displays: vec![
                display("main", Rect::new(0, 0, 60, 40), true),
                display("edge", Rect::new(i32::MAX - 5, 0, 100, 10), false),
            ],
        };
        assert!(matches!(
            renderer.apply_display_data(&hostile),
            Err(CodecError::InvalidDisplaySet(_))
        ));

        let spread = DisplayDataDto {
            session_id: Uuid::new_v4(),
            displays: vec![
                display("far-left", Rect::new(i32::MIN, 0, 10, 10), false),
                display("far-right", Rect::new(i32::MAX - 10, 0, 10, 10), true),
            ],
        };
        assert!(renderer.apply_display_data(&spread).is_err());

        assert_eq!(renderer.surface_bounds(), Rect::new(-40, 0, 100, 40));
        assert_eq!(renderer.session_id(), session_id);
        assert_eq!(renderer.displays().len(), 2);
    }

    #[test]
    fn test_surface_above_pixel_limit_is_rejected() {
        let mut renderer = RegionRenderer::with_pixel_limit(100 * 40);
        renderer.apply_display_data(&two_displays()).unwrap();

        let huge = DisplayDataDto {
            session_id: Uuid::new_v4(),
            displays: vec![display("main", Rect::new(0, 0, 1_000_000, 1_000_000), true)],
        };
        assert!(matches!(
            renderer.apply_display_data(&huge),
            Err(CodecError::InvalidDisplaySet(_))
        ));
        let surface = renderer.snapshot().unwrap();
        assert_eq!((surface.width(), surface.height()), (100, 40));
    }

    #[test]
    fn test_region_far_outside_origin_is_rejected() {
        let mut renderer = RegionRenderer::new();
        renderer.apply_display_data(&two_displays()).unwrap();

        let mut dto = region(0, 0, &Bitmap::filled(2, 2, OPAQUE_BLACK));
        dto.x = i32::MAX - 1;
        assert!(matches!(
            renderer.apply_region(&dto),
            Err(CodecError::RegionOutOfBounds(_))
        ));

        assert_eq!(renderer.regions_applied(), 0);

        // Representable but entirely off the surface
        let mut dto = region(i32::MIN, 0, &Bitmap::filled(2, 2, OPAQUE_BLACK));
        dto.y = i32::MAX - 2;
        assert_eq!(renderer.apply_region(&dto).unwrap(), Rect::EMPTY);
    }

    #[test]
    fn test_save_png() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("surface.png");

        let mut renderer = RegionRenderer::new();
        assert!(renderer.save_png(&path).is_err());

        renderer.apply_display_data(&two_displays()).unwrap();
        renderer
            .apply_region(&region(0, 0, &Bitmap::filled(2, 2, [255, 0, 0, 255])))
            .unwrap();
        renderer.save_png(&path).unwrap();

        let saved = decode_image(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!((saved.width(), saved.height()), (100, 40));
        assert_eq!(saved.pixel(40, 0), Some([255, 0, 0, 255]));
    }
}
