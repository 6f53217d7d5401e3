//! Capture types and data structures
//!
//! Geometry, display snapshots, the BGRA bitmap and the tagged capture
//! result shared by every backend.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CodecError, CodecResult};

/// Bytes per BGRA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Axis-aligned rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
}

impl Rect {
    /// The empty rectangle at the origin
    pub const EMPTY: Rect = Rect {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    /// Creates a new rectangle
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Creates a rectangle from its edges
    pub fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right.saturating_sub(left), bottom.saturating_sub(top))
    }

    /// Returns the exclusive right edge, saturating at `i32::MAX`
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    /// Returns the exclusive bottom edge, saturating at `i32::MAX`
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    /// Returns the exclusive right edge, or `None` if it overflows
    pub fn checked_right(&self) -> Option<i32> {
        self.x.checked_add(self.width)
    }

    /// Returns the exclusive bottom edge, or `None` if it overflows
    pub fn checked_bottom(&self) -> Option<i32> {
        self.y.checked_add(self.height)
    }

    /// Returns true if the size is non-negative and both far edges fit in
    /// an `i32`
    pub fn is_representable(&self) -> bool {
        self.width >= 0
            && self.height >= 0
            && self.checked_right().is_some()
            && self.checked_bottom().is_some()
    }

    /// Returns true if the rectangle covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Returns the number of pixels covered
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Returns the overlap of two rectangles, or `Rect::EMPTY`
    pub fn intersect(&self, other: &Rect) -> Rect {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left || bottom <= top {
            Rect::EMPTY
        } else {
            Rect::from_ltrb(left, top, right, bottom)
        }
    }

    /// Returns the bounding box of two rectangles; empty inputs are ignored
    pub fn union(&self, other: &Rect) -> Rect {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Rect::EMPTY,
            (true, false) => *other,
            (false, true) => *self,
            (false, false) => Rect::from_ltrb(
                self.x.min(other.x),
                self.y.min(other.y),
                self.right().max(other.right()),
                self.bottom().max(other.bottom()),
            ),
        }
    }

    /// Like [`Rect::union`], but `None` if either input is not
    /// representable or the bounding box is too large for an `i32` size
    pub fn checked_union(&self, other: &Rect) -> Option<Rect> {
        if !self.is_representable() || !other.is_representable() {
            return None;
        }
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Some(Rect::EMPTY),
            (true, false) => Some(*other),
            (false, true) => Some(*self),
            (false, false) => {
                let left = self.x.min(other.x);
                let top = self.y.min(other.y);
                let right = self.right().max(other.right());
                let bottom = self.bottom().max(other.bottom());
                Some(Rect::new(left, top, right.checked_sub(left)?, bottom.checked_sub(top)?))
            }
        }
    }

    /// Returns the bounding box of every rectangle in the iterator
    pub fn union_all<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Rect {
        rects
            .into_iter()
            .fold(Rect::EMPTY, |acc, rect| acc.union(rect))
    }

    /// Returns true if `other` lies entirely inside this rectangle
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Returns true if the point lies inside this rectangle
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    /// Returns the rectangle moved by `(dx, dy)`
    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x.saturating_add(dx), self.y.saturating_add(dy), self.width, self.height)
    }

    /// Maps a rectangle of a `src_width` x `src_height` surface onto the same
    /// surface turned clockwise by `rotation`
    pub fn rotate_within(&self, rotation: Rotation, src_width: i32, src_height: i32) -> Rect {
        match rotation {
            Rotation::Identity => *self,
            Rotation::Rotate90 => Rect::new(src_height - self.bottom(), self.x, self.height, self.width),
            Rotation::Rotate180 => Rect::new(
                src_width - self.right(),
                src_height - self.bottom(),
                self.width,
                self.height,
            ),
            Rotation::Rotate270 => Rect::new(self.y, src_width - self.right(), self.height, self.width),
        }
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Display orientation, in clockwise quarter turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    /// Landscape, no rotation
    #[default]
    Identity,
    /// Rotated 90 degrees
    Rotate90,
    /// Rotated 180 degrees
    Rotate180,
    /// Rotated 270 degrees
    Rotate270,
}

impl Rotation {
    /// Builds a rotation from degrees, snapping to the nearest quarter turn
    pub fn from_degrees(degrees: f32) -> Self {
        let quarter = ((degrees / 90.0).round() as i32).rem_euclid(4);
        match quarter {
            1 => Rotation::Rotate90,
            2 => Rotation::Rotate180,
            3 => Rotation::Rotate270,
            _ => Rotation::Identity,
        }
    }

    /// The clockwise turn that brings a duplicated surface upright
    pub fn correction(self) -> Rotation {
        match self {
            Rotation::Identity => Rotation::Identity,
            Rotation::Rotate90 => Rotation::Rotate270,
            Rotation::Rotate180 => Rotation::Rotate180,
            Rotation::Rotate270 => Rotation::Rotate90,
        }
    }

    /// Returns true if width and height swap under this rotation
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

/// Immutable snapshot of one monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    /// Stable unique identifier (for example `\\.\DISPLAY1`)
    pub device_name: String,
    /// Human readable name
    pub display_name: String,
    /// Bounds in virtual-desktop coordinates
    pub monitor_area: Rect,
    /// Whether this is the primary display
    pub is_primary: bool,
    /// Current orientation
    pub rotation: Rotation,
    /// DPI scale factor (1.0 = 96 DPI)
    pub scale_factor: f64,
}

impl DisplayInfo {
    /// Creates a display snapshot with default name, orientation and scale
    pub fn new(device_name: impl Into<String>, monitor_area: Rect, is_primary: bool) -> Self {
        let device_name = device_name.into();
        Self {
            display_name: device_name.clone(),
            device_name,
            monitor_area,
            is_primary,
            rotation: Rotation::Identity,
            scale_factor: 1.0,
        }
    }

    /// Sets the orientation
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }
}

/// Owned 32-bit BGRA pixel buffer with tightly packed rows
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Bitmap {
    /// Creates a zeroed (transparent black) bitmap
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    /// Creates a bitmap filled with one BGRA color
    pub fn filled(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&bgra);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Wraps existing BGRA pixels
    ///
    /// # Errors
    ///
    /// Returns error if the buffer length does not match the dimensions
    pub fn from_bgra(width: u32, height: u32, data: Vec<u8>) -> CodecResult<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(CodecError::InvalidBitmap(format!(
                "expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Copies rows out of a buffer whose rows are `pitch` bytes apart
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is too short or the pitch too narrow
    pub fn from_pitched(width: u32, height: u32, pitch: usize, src: &[u8]) -> CodecResult<Self> {
        let row_bytes = width as usize * BYTES_PER_PIXEL;
        if pitch < row_bytes || src.len() < pitch * height.saturating_sub(1) as usize + row_bytes {
            return Err(CodecError::InvalidBitmap(format!(
                "pitch {} too small for {}x{} ({} bytes)",
                pitch,
                width,
                height,
                src.len()
            )));
        }

        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * pitch;
            data.extend_from_slice(&src[start..start + row_bytes]);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Converts an RGBA image into a BGRA bitmap
    pub fn from_rgba_image(image: &image::RgbaImage) -> Self {
        let mut data = image.as_raw().clone();
        for px in data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
        Self {
            width: image.width(),
            height: image.height(),
            data,
        }
    }

    /// Converts to an RGBA image
    pub fn to_rgba_image(&self) -> image::RgbaImage {
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
        // Length is width * height * 4 by construction
        image::RgbaImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| image::RgbaImage::new(self.width, self.height))
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Raw BGRA bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw BGRA bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The rectangle `(0, 0, width, height)`
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// Returns the BGRA value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.data[idx..idx + BYTES_PER_PIXEL]);
        Some(px)
    }

    /// Sets the BGRA value at `(x, y)`; out-of-range writes are ignored
    pub fn set_pixel(&mut self, x: u32, y: u32, bgra: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        self.data[idx..idx + BYTES_PER_PIXEL].copy_from_slice(&bgra);
    }

    /// Fills a rectangle (clipped to the bitmap) with one color
    pub fn fill_rect(&mut self, rect: Rect, bgra: [u8; 4]) {
        let clipped = rect.intersect(&self.bounds());
        for y in clipped.y..clipped.bottom() {
            for x in clipped.x..clipped.right() {
                self.set_pixel(x as u32, y as u32, bgra);
            }
        }
    }

    /// Copies out a sub-rectangle
    ///
    /// # Errors
    ///
    /// Returns error if `rect` is empty or not fully inside the bitmap
    pub fn crop(&self, rect: Rect) -> CodecResult<Bitmap> {
        if rect.is_empty() || !self.bounds().contains_rect(&rect) {
            return Err(CodecError::RegionOutOfBounds(rect.to_string()));
        }

        let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
        let mut data = Vec::with_capacity(row_bytes * rect.height as usize);
        for y in rect.y..rect.bottom() {
            let start = y as usize * self.stride() + rect.x as usize * BYTES_PER_PIXEL;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }

        Ok(Bitmap {
            width: rect.width as u32,
            height: rect.height as u32,
            data,
        })
    }

    /// Copies `src` onto this bitmap with its top-left at `(x, y)`, clipped
    ///
    /// Returns the destination rectangle actually written.
    pub fn blit(&mut self, src: &Bitmap, x: i32, y: i32) -> Rect {
        let target = Rect::new(x, y, src.width as i32, src.height as i32).intersect(&self.bounds());
        if target.is_empty() {
            return Rect::EMPTY;
        }

        let row_bytes = target.width as usize * BYTES_PER_PIXEL;
        for row in 0..target.height {
            let src_x = (target.x - x) as usize;
            let src_y = (target.y - y + row) as usize;
            let src_start = src_y * src.stride() + src_x * BYTES_PER_PIXEL;
            let dst_start =
                (target.y + row) as usize * self.stride() + target.x as usize * BYTES_PER_PIXEL;
            self.data[dst_start..dst_start + row_bytes]
                .copy_from_slice(&src.data[src_start..src_start + row_bytes]);
        }
        target
    }

    /// Returns a copy turned clockwise by `rotation`
    pub fn rotated(&self, rotation: Rotation) -> Bitmap {
        if rotation == Rotation::Identity {
            return self.clone();
        }

        let (w, h) = (self.width, self.height);
        let (dst_w, dst_h) = if rotation.swaps_axes() { (h, w) } else { (w, h) };
        let mut out = Bitmap::new(dst_w, dst_h);

        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match rotation {
                    Rotation::Identity => (x, y),
                    Rotation::Rotate90 => (h - 1 - y, x),
                    Rotation::Rotate180 => (w - 1 - x, h - 1 - y),
                    Rotation::Rotate270 => (y, w - 1 - x),
                };
                let src = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
                let dst = dy as usize * out.stride() + dx as usize * BYTES_PER_PIXEL;
                out.data[dst..dst + BYTES_PER_PIXEL]
                    .copy_from_slice(&self.data[src..src + BYTES_PER_PIXEL]);
            }
        }
        out
    }

    /// Bounding box of every pixel that differs from `previous`
    ///
    /// Returns the full bounds when there is no previous bitmap or the
    /// dimensions changed.
    pub fn changed_area(&self, previous: Option<&Bitmap>) -> Rect {
        let previous = match previous {
            Some(prev) if prev.width == self.width && prev.height == self.height => prev,
            _ => return self.bounds(),
        };

        let stride = self.stride();
        let mut left = i32::MAX;
        let mut top = i32::MAX;
        let mut right = i32::MIN;
        let mut bottom = i32::MIN;

        for y in 0..self.height as usize {
            let row = &self.data[y * stride..(y + 1) * stride];
            let prev_row = &previous.data[y * stride..(y + 1) * stride];
            if row == prev_row {
                continue;
            }
            for (x, (a, b)) in row
                .chunks_exact(BYTES_PER_PIXEL)
                .zip(prev_row.chunks_exact(BYTES_PER_PIXEL))
                .enumerate()
            {
                if a != b {
                    left = left.min(x as i32);
                    right = right.max(x as i32 + 1);
                }
            }
            top = top.min(y as i32);
            bottom = y as i32 + 1;
        }

        if right <= left {
            Rect::EMPTY
        } else {
            Rect::from_ltrb(left, top, right, bottom)
        }
    }
}

/// Which parts of a captured frame changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyRects {
    /// Whole frame; the backend cannot report partial updates
    Full,
    /// Only these rectangles (frame-relative); empty means none changed
    Partial(Vec<Rect>),
}

impl DirtyRects {
    /// Resolves to concrete frame-relative rectangles
    pub fn resolve(&self, frame_bounds: Rect) -> Vec<Rect> {
        match self {
            DirtyRects::Full => vec![frame_bounds],
            DirtyRects::Partial(rects) => rects.clone(),
        }
    }

    /// Returns true if this covers the whole frame
    pub fn is_full(&self) -> bool {
        matches!(self, DirtyRects::Full)
    }
}

/// A successfully captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Upright BGRA pixels of the captured area
    pub bitmap: Bitmap,
    /// Changed areas, relative to the bitmap
    pub dirty_rects: DirtyRects,
    /// Whether the GPU path produced this frame
    pub is_using_gpu: bool,
}

/// Why a capture attempt produced nothing
#[derive(Debug, Clone)]
pub struct CaptureFailure {
    /// Short human readable reason
    pub reason: String,
    /// Underlying error, when there is one
    pub error: Option<CaptureError>,
}

/// Tagged outcome of one capture attempt
#[derive(Debug, Clone)]
pub enum CaptureResult {
    /// New pixels
    Frame(CapturedFrame),
    /// The display has not changed since the last poll
    NoChanges,
    /// Capture failed for this attempt
    Failed(CaptureFailure),
}

impl CaptureResult {
    /// Builds a failure from an error
    pub fn failed(reason: impl Into<String>, error: Option<CaptureError>) -> Self {
        CaptureResult::Failed(CaptureFailure {
            reason: reason.into(),
            error,
        })
    }

    /// Returns true for a frame result
    pub fn is_frame(&self) -> bool {
        matches!(self, CaptureResult::Frame(_))
    }

    /// Returns the frame, if any
    pub fn frame(&self) -> Option<&CapturedFrame> {
        match self {
            CaptureResult::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}
