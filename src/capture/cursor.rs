//! Pointer compositing
//!
//! The capture APIs return the desktop without the pointer. The compositor
//! asks a `CursorSource` for the current pointer and alpha-blends it onto
//! the captured bitmap.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::types::{Bitmap, Rect};

/// Well-known pointer shapes, forwarded to viewers that draw their own cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CursorKind {
    /// Unrecognized or custom shape
    #[default]
    Unknown,
    /// Standard arrow
    Arrow,
    /// Text selection
    IBeam,
    /// Link hand
    Hand,
    /// Busy
    Wait,
    /// Horizontal resize
    SizeWe,
    /// Vertical resize
    SizeNs,
    /// Diagonal resize (top-left to bottom-right)
    SizeNwse,
    /// Diagonal resize (top-right to bottom-left)
    SizeNesw,
    /// Move
    SizeAll,
    /// Not allowed
    No,
}

/// Rendered pointer image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    /// Straight-alpha BGRA pixels
    pub image: Bitmap,
    /// Hotspot offset inside `image`
    pub hotspot_x: i32,
    /// Hotspot offset inside `image`
    pub hotspot_y: i32,
}

/// Pointer state at one instant
#[derive(Debug, Clone)]
pub struct CursorState {
    /// Whether the pointer is shown
    pub visible: bool,
    /// Hotspot position in virtual-desktop coordinates
    pub x: i32,
    /// Hotspot position in virtual-desktop coordinates
    pub y: i32,
    /// Shape classification
    pub kind: CursorKind,
    /// Image to draw, if the source could render one
    pub shape: Option<Arc<CursorShape>>,
}

/// Provider of the current pointer
pub trait CursorSource: Send {
    /// Returns the current pointer, or `None` if it cannot be queried
    fn query(&mut self) -> Option<CursorState>;
}

/// Source that never reports a pointer
#[derive(Debug, Default)]
pub struct HiddenCursorSource;

impl CursorSource for HiddenCursorSource {
    fn query(&mut self) -> Option<CursorState> {
        None
    }
}

/// Draws the pointer onto captured bitmaps
///
/// The compositor is shared by both backends, so it remembers where the
/// pointer was last drawn no matter which backend produced that frame.
pub struct CursorCompositor {
    source: Box<dyn CursorSource>,
    last_kind: Option<CursorKind>,
    /// Virtual-desktop coordinates
    last_drawn: Rect,
}

impl CursorCompositor {
    /// Creates a compositor over the given source
    pub fn new(source: Box<dyn CursorSource>) -> Self {
        Self {
            source,
            last_kind: None,
            last_drawn: Rect::EMPTY,
        }
    }

    /// Creates a compositor over the platform pointer
    pub fn system() -> Self {
        Self::new(default_cursor_source())
    }

    /// Draws the pointer onto `bitmap`, which shows `capture_area` of the
    /// virtual desktop
    ///
    /// Returns the bitmap-relative rectangle that was drawn over, or an
    /// empty rect if the pointer is hidden or outside the area.
    pub fn draw(&mut self, bitmap: &mut Bitmap, capture_area: Rect) -> Rect {
        let drawn = self.composite(bitmap, capture_area);
        self.last_drawn = drawn.offset(capture_area.x, capture_area.y);
        drawn
    }

    fn composite(&mut self, bitmap: &mut Bitmap, capture_area: Rect) -> Rect {
        let state = match self.source.query() {
            Some(state) => state,
            None => return Rect::EMPTY,
        };
        self.last_kind = Some(state.kind);

        if !state.visible || !capture_area.contains_point(state.x, state.y) {
            return Rect::EMPTY;
        }

        let shape = match state.shape.as_deref() {
            Some(shape) => shape,
            None => return Rect::EMPTY,
        };

        let left = state.x.saturating_sub(capture_area.x).saturating_sub(shape.hotspot_x);
        let top = state.y.saturating_sub(capture_area.y).saturating_sub(shape.hotspot_y);
        let drawn = blend_onto(bitmap, &shape.image, left, top);

        trace!("Composited cursor at {}", drawn);
        drawn
    }

    /// Rectangle covered by the previous draw, relative to `capture_area`
    ///
    /// Frames that do not repaint the whole area must include it so the
    /// old pointer image gets overwritten.
    pub fn previous_rect(&self, capture_area: Rect) -> Rect {
        let visible = self.last_drawn.intersect(&capture_area);
        if visible.is_empty() {
            return Rect::EMPTY;
        }
        visible.offset(capture_area.x.saturating_neg(), capture_area.y.saturating_neg())
    }

    /// Queries the pointer and returns its kind if it changed since the
    /// last query
    pub fn poll_kind_change(&mut self) -> Option<CursorKind> {
        let kind = self.source.query()?.kind;
        if self.last_kind == Some(kind) {
            return None;
        }
        self.last_kind = Some(kind);
        Some(kind)
    }
}

/// Alpha-blends `src` onto `dst` at `(left, top)`; returns the clipped
/// destination rectangle
fn blend_onto(dst: &mut Bitmap, src: &Bitmap, left: i32, top: i32) -> Rect {
    let target = Rect::new(left, top, src.width() as i32, src.height() as i32).intersect(&dst.bounds());
    if target.is_empty() {
        return Rect::EMPTY;
    }

    for y in target.y..target.bottom() {
        for x in target.x..target.right() {
            let (sx, sy) = ((x - left) as u32, (y - top) as u32);
            let (Some(s), Some(d)) = (src.pixel(sx, sy), dst.pixel(x as u32, y as u32)) else {
                continue;
            };
            let alpha = s[3] as u32;
            if alpha == 0 {
                continue;
            }
            let mix = |sc: u8, dc: u8| ((sc as u32 * alpha + dc as u32 * (255 - alpha) + 127) / 255) as u8;
            dst.set_pixel(x as u32, y as u32, [mix(s[0], d[0]), mix(s[1], d[1]), mix(s[2], d[2]), 255]);
        }
    }
    target
}

/// Returns the pointer source for this platform
pub fn default_cursor_source() -> Box<dyn CursorSource> {
    #[cfg(windows)]
    {
        Box::new(windows_cursor::WindowsCursorSource::default())
    }
    #[cfg(not(windows))]
    {
        Box::new(HiddenCursorSource)
    }
}

#[cfg(windows)]
mod windows_cursor {
    //! GDI pointer query and rendering

    use std::ffi::c_void;
    use std::mem::size_of;
    use std::sync::Arc;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{COLORREF, RECT};
    use windows::Win32::Graphics::Gdi::{
        CreateCompatibleBitmap, CreateCompatibleDC, CreateSolidBrush, DeleteDC, DeleteObject,
        FillRect, GetDC, GetDIBits, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER,
        BI_RGB, DIB_RGB_COLORS, HBITMAP, HDC, HGDIOBJ,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        DrawIconEx, GetCursorInfo, GetIconInfo, GetSystemMetrics, LoadCursorW, CURSORINFO,
        CURSOR_SHOWING, DI_NORMAL, HCURSOR, HICON, ICONINFO, IDC_APPSTARTING, IDC_ARROW,
        IDC_HAND, IDC_IBEAM, IDC_NO, IDC_SIZEALL, IDC_SIZENESW, IDC_SIZENS, IDC_SIZENWSE,
        IDC_SIZEWE, IDC_WAIT, SM_CXCURSOR, SM_CYCURSOR,
    };

    use super::{CursorKind, CursorShape, CursorSource, CursorState};
    use crate::capture::types::Bitmap;

    struct ScreenDc(HDC);

    impl Drop for ScreenDc {
        fn drop(&mut self) {
            unsafe {
                ReleaseDC(None, self.0);
            }
        }
    }

    struct MemoryDc(HDC);

    impl Drop for MemoryDc {
        fn drop(&mut self) {
            unsafe {
                let _ = DeleteDC(self.0);
            }
        }
    }

    struct GdiObject(HGDIOBJ);

    impl Drop for GdiObject {
        fn drop(&mut self) {
            if !self.0 .0.is_null() {
                unsafe {
                    let _ = DeleteObject(self.0);
                }
            }
        }
    }

    struct Selection {
        dc: HDC,
        previous: HGDIOBJ,
    }

    impl Drop for Selection {
        fn drop(&mut self) {
            unsafe {
                SelectObject(self.dc, self.previous);
            }
        }
    }

    #[derive(Default)]
    pub(super) struct WindowsCursorSource {
        cached: Option<(isize, Arc<CursorShape>)>,
        known: Vec<(isize, CursorKind)>,
    }

    impl WindowsCursorSource {
        fn kind_of(&mut self, cursor: HCURSOR) -> CursorKind {
            if self.known.is_empty() {
                let table = [
                    (IDC_ARROW, CursorKind::Arrow),
                    (IDC_IBEAM, CursorKind::IBeam),
                    (IDC_HAND, CursorKind::Hand),
                    (IDC_WAIT, CursorKind::Wait),
                    (IDC_APPSTARTING, CursorKind::Wait),
                    (IDC_SIZEWE, CursorKind::SizeWe),
                    (IDC_SIZENS, CursorKind::SizeNs),
                    (IDC_SIZENWSE, CursorKind::SizeNwse),
                    (IDC_SIZENESW, CursorKind::SizeNesw),
                    (IDC_SIZEALL, CursorKind::SizeAll),
                    (IDC_NO, CursorKind::No),
                ];
                for (id, kind) in table {
                    if let Ok(handle) = unsafe { LoadCursorW(None, PCWSTR(id.0)) } {
                        self.known.push((handle.0 as isize, kind));
                    }
                }
            }

            self.known
                .iter()
                .find(|(handle, _)| *handle == cursor.0 as isize)
                .map(|(_, kind)| *kind)
                .unwrap_or(CursorKind::Unknown)
        }

        fn shape_of(&mut self, cursor: HCURSOR) -> Option<Arc<CursorShape>> {
            let key = cursor.0 as isize;
            if let Some((cached, shape)) = &self.cached {
                if *cached == key {
                    return Some(Arc::clone(shape));
                }
            }

            let shape = Arc::new(unsafe { render_cursor(cursor)? });
            self.cached = Some((key, Arc::clone(&shape)));
            Some(shape)
        }
    }

    impl CursorSource for WindowsCursorSource {
        fn query(&mut self) -> Option<CursorState> {
            let mut info = CURSORINFO {
                cbSize: size_of::<CURSORINFO>() as u32,
                ..Default::default()
            };
            unsafe { GetCursorInfo(&mut info) }.ok()?;

            let visible = info.flags.0 & CURSOR_SHOWING.0 != 0 && !info.hCursor.0.is_null();
            let (kind, shape) = if visible {
                (self.kind_of(info.hCursor), self.shape_of(info.hCursor))
            } else {
                (CursorKind::Unknown, None)
            };

            Some(CursorState {
                visible,
                x: info.ptScreenPos.x,
                y: info.ptScreenPos.y,
                kind,
                shape,
            })
        }
    }

    /// Renders the cursor twice (on black and on white) to recover alpha
    unsafe fn render_cursor(cursor: HCURSOR) -> Option<CursorShape> {
        let mut icon = ICONINFO::default();
        GetIconInfo(HICON(cursor.0), &mut icon).ok()?;
        let _mask = GdiObject(icon.hbmMask.into());
        let _color = GdiObject(icon.hbmColor.into());

        let width = GetSystemMetrics(SM_CXCURSOR).max(1);
        let height = GetSystemMetrics(SM_CYCURSOR).max(1);

        let on_black = draw_on_background(cursor, width, height, 0x0000_0000)?;
        let on_white = draw_on_background(cursor, width, height, 0x00FF_FFFF)?;

        let mut pixels = Vec::with_capacity(on_black.len());
        for (b, w) in on_black.chunks_exact(4).zip(on_white.chunks_exact(4)) {
            // white - black = 255 * (1 - alpha) for every channel
            let spread = (w[0] as i32 - b[0] as i32)
                .max(w[1] as i32 - b[1] as i32)
                .max(w[2] as i32 - b[2] as i32)
                .clamp(0, 255);
            let alpha = 255 - spread;
            if alpha == 0 {
                pixels.extend_from_slice(&[0, 0, 0, 0]);
                continue;
            }
            let unpremultiply = |c: u8| ((c as i32 * 255 + alpha / 2) / alpha).clamp(0, 255) as u8;
            pixels.extend_from_slice(&[
                unpremultiply(b[0]),
                unpremultiply(b[1]),
                unpremultiply(b[2]),
                alpha as u8,
            ]);
        }

        let image = Bitmap::from_bgra(width as u32, height as u32, pixels).ok()?;
        Some(CursorShape {
            image,
            hotspot_x: icon.xHotspot as i32,
            hotspot_y: icon.yHotspot as i32,
        })
    }

    unsafe fn draw_on_background(cursor: HCURSOR, width: i32, height: i32, background: u32) -> Option<Vec<u8>> {
        let screen = GetDC(None);
        if screen.0.is_null() {
            return None;
        }
        let screen = ScreenDc(screen);

        let memory = CreateCompatibleDC(Some(screen.0));
        if memory.0.is_null() {
            return None;
        }
        let memory = MemoryDc(memory);

        let bitmap: HBITMAP = CreateCompatibleBitmap(screen.0, width, height);
        if bitmap.0.is_null() {
            return None;
        }
        let bitmap_obj = GdiObject(bitmap.into());

        {
            let _selection = Selection {
                dc: memory.0,
                previous: SelectObject(memory.0, bitmap_obj.0),
            };

            let brush = GdiObject(CreateSolidBrush(COLORREF(background)).into());
            let area = RECT {
                left: 0,
                top: 0,
                right: width,
                bottom: height,
            };
            FillRect(memory.0, &area, windows::Win32::Graphics::Gdi::HBRUSH(brush.0 .0));
            DrawIconEx(memory.0, 0, 0, HICON(cursor.0), width, height, 0, None, DI_NORMAL).ok()?;
        }

        let mut info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width,
                // Negative height selects a top-down DIB
                biHeight: -height,
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        let lines = GetDIBits(
            memory.0,
            bitmap,
            0,
            height as u32,
            Some(pixels.as_mut_ptr() as *mut c_void),
            &mut info,
            DIB_RGB_COLORS,
        );
        if lines == 0 {
            return None;
        }
        Some(pixels)
    }
}
