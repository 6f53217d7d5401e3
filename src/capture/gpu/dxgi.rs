//! DXGI desktop duplication
//!
//! Every COM interface is released when its wrapper drops, so dropping a
//! `DxgiOutput` tears down the duplication, device and staging texture.

use std::mem;
use std::slice;

use tracing::debug;
use windows::core::Interface;
use windows::Win32::Foundation::{HMODULE, RECT};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2,
    D3D_FEATURE_LEVEL_9_3,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_READ, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_MODE_ROTATION, DXGI_MODE_ROTATION_ROTATE180, DXGI_MODE_ROTATION_ROTATE270,
    DXGI_MODE_ROTATION_ROTATE90,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter, IDXGIFactory1, IDXGIOutput, IDXGIOutput1,
    IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_NOT_FOUND, DXGI_OUTDUPL_FRAME_INFO,
    DXGI_OUTPUT_DESC,
};

use super::{AcquireOutcome, DuplicatedOutput, DuplicationApi, FrameError, RawFrame};
use crate::capture::display::DisplaySource;
use crate::capture::types::{Bitmap, DisplayInfo, Rect, Rotation, BYTES_PER_PIXEL};
use crate::error::CaptureError;

const FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 7] = [
    D3D_FEATURE_LEVEL_11_1,
    D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_10_0,
    D3D_FEATURE_LEVEL_9_3,
    D3D_FEATURE_LEVEL_9_2,
    D3D_FEATURE_LEVEL_9_1,
];

fn os_error(context: &'static str, err: windows::core::Error) -> CaptureError {
    CaptureError::Os {
        context,
        code: err.code().0 as u32,
    }
}

fn frame_error(context: &'static str, err: windows::core::Error) -> FrameError {
    FrameError {
        context,
        code: err.code().0 as u32,
    }
}

fn wide_to_string(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

fn rotation_of(rotation: DXGI_MODE_ROTATION) -> Rotation {
    match rotation {
        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
        _ => Rotation::Identity,
    }
}

fn rect_of(r: &RECT) -> Rect {
    Rect::from_ltrb(r.left, r.top, r.right, r.bottom)
}

/// Walks every desktop-attached output of every adapter
fn for_each_output(
    mut visit: impl FnMut(&IDXGIAdapter, IDXGIOutput, DXGI_OUTPUT_DESC) -> bool,
) -> Result<(), CaptureError> {
    unsafe {
        let factory: IDXGIFactory1 =
            CreateDXGIFactory1().map_err(|e| os_error("CreateDXGIFactory1", e))?;

        for adapter_index in 0.. {
            let adapter = match factory.EnumAdapters1(adapter_index) {
                Ok(adapter) => adapter,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => return Err(os_error("EnumAdapters1", e)),
            };
            let adapter: IDXGIAdapter = adapter
                .cast()
                .map_err(|e| os_error("IDXGIAdapter1::cast<IDXGIAdapter>", e))?;

            for output_index in 0.. {
                let output = match adapter.EnumOutputs(output_index) {
                    Ok(output) => output,
                    Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                    Err(e) => return Err(os_error("IDXGIAdapter::EnumOutputs", e)),
                };
                let desc = output
                    .GetDesc()
                    .map_err(|e| os_error("IDXGIOutput::GetDesc", e))?;
                if !desc.AttachedToDesktop.as_bool() {
                    continue;
                }
                if !visit(&adapter, output, desc) {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn create_device(adapter: &IDXGIAdapter) -> Result<(ID3D11Device, ID3D11DeviceContext), CaptureError> {
    unsafe {
        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;

        // An explicit adapter requires the unknown driver type
        D3D11CreateDevice(
            adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&FEATURE_LEVELS),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| os_error("D3D11CreateDevice", e))?;

        match (device, context) {
            (Some(device), Some(context)) => Ok((device, context)),
            _ => Err(CaptureError::Os {
                context: "D3D11CreateDevice",
                code: 0,
            }),
        }
    }
}

/// DXGI-backed `DuplicationApi`
#[derive(Debug, Default)]
pub struct DxgiDuplication;

impl DuplicationApi for DxgiDuplication {
    type Output = DxgiOutput;

    fn open_output(&mut self, device_name: &str) -> Result<DxgiOutput, CaptureError> {
        let mut found: Option<(IDXGIAdapter, IDXGIOutput, DXGI_OUTPUT_DESC)> = None;
        for_each_output(|adapter, output, desc| {
            if wide_to_string(&desc.DeviceName) == device_name {
                found = Some((adapter.clone(), output, desc));
                return false;
            }
            true
        })?;

        let (adapter, output, desc) =
            found.ok_or_else(|| CaptureError::DisplayNotFound(device_name.to_string()))?;

        let (device, context) = create_device(&adapter)?;
        let duplication = unsafe {
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| os_error("IDXGIOutput::cast<IDXGIOutput1>", e))?;
            output1
                .DuplicateOutput(&device)
                .map_err(|e| os_error("IDXGIOutput1::DuplicateOutput", e))?
        };

        debug!("Created DXGI duplication for {}", device_name);
        Ok(DxgiOutput {
            device,
            context,
            duplication,
            staging: None,
            holds_frame: false,
            bounds: rect_of(&desc.DesktopCoordinates),
            rotation: rotation_of(desc.Rotation),
        })
    }
}

/// One duplicated DXGI output
pub struct DxgiOutput {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: Option<(ID3D11Texture2D, u32, u32)>,
    holds_frame: bool,
    bounds: Rect,
    rotation: Rotation,
}

// COM pointers are only touched by the capture thread that owns the output
unsafe impl Send for DxgiOutput {}

impl DxgiOutput {
    fn staging_for(&mut self, texture: &ID3D11Texture2D) -> Result<(ID3D11Texture2D, u32, u32), FrameError> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        if let Some((staging, w, h)) = &self.staging {
            if *w == desc.Width && *h == desc.Height {
                return Ok((staging.clone(), *w, *h));
            }
        }

        desc.Usage = D3D11_USAGE_STAGING;
        desc.BindFlags = 0;
        desc.CPUAccessFlags = D3D11_CPU_ACCESS_READ.0 as u32;
        desc.MiscFlags = 0;
        desc.MipLevels = 1;
        desc.ArraySize = 1;

        let mut staging: Option<ID3D11Texture2D> = None;
        unsafe {
            self.device
                .CreateTexture2D(&desc, None, Some(&mut staging))
                .map_err(|e| frame_error("CreateTexture2D (staging)", e))?;
        }
        let staging = staging.ok_or(FrameError {
            context: "CreateTexture2D (staging)",
            code: 0,
        })?;

        self.staging = Some((staging.clone(), desc.Width, desc.Height));
        Ok((staging, desc.Width, desc.Height))
    }

    fn copy_out(&mut self, texture: &ID3D11Texture2D) -> Result<Bitmap, FrameError> {
        let (staging, width, height) = self.staging_for(texture)?;

        unsafe {
            self.context.CopyResource(&staging, texture);

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            self.context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| frame_error("Map staging texture", e))?;

            let pitch = mapped.RowPitch as usize;
            let row = width as usize * BYTES_PER_PIXEL;
            let len = pitch * (height as usize).saturating_sub(1) + row;
            let src = slice::from_raw_parts(mapped.pData as *const u8, len);
            let bitmap = Bitmap::from_pitched(width, height, pitch, src);

            self.context.Unmap(&staging, 0);

            bitmap.map_err(|_| FrameError {
                context: "Map staging texture",
                code: 0,
            })
        }
    }

    fn dirty_rects(&self, info: &DXGI_OUTDUPL_FRAME_INFO) -> Result<Vec<Rect>, FrameError> {
        if info.TotalMetadataBufferSize == 0 {
            return Ok(Vec::new());
        }

        let capacity = info.TotalMetadataBufferSize as usize / mem::size_of::<RECT>() + 1;
        let mut rects = vec![RECT::default(); capacity];
        let mut required = 0u32;
        unsafe {
            self.duplication
                .GetFrameDirtyRects(
                    (rects.len() * mem::size_of::<RECT>()) as u32,
                    rects.as_mut_ptr(),
                    &mut required,
                )
                .map_err(|e| frame_error("GetFrameDirtyRects", e))?;
        }

        let count = required as usize / mem::size_of::<RECT>();
        Ok(rects.iter().take(count).map(rect_of).collect())
    }
}

impl DuplicatedOutput for DxgiOutput {
    fn bounds(&self) -> Rect {
        self.bounds
    }

    fn rotation(&self) -> Rotation {
        self.rotation
    }

    fn acquire_frame(&mut self) -> Result<AcquireOutcome, FrameError> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        unsafe {
            self.duplication
                .AcquireNextFrame(0, &mut info, &mut resource)
                .map_err(|e| frame_error("AcquireNextFrame", e))?;
        }
        self.holds_frame = true;

        if info.AccumulatedFrames == 0 {
            return Ok(AcquireOutcome::NoChanges);
        }

        let resource = resource.ok_or(FrameError {
            context: "AcquireNextFrame",
            code: 0,
        })?;
        let texture: ID3D11Texture2D = resource
            .cast()
            .map_err(|e| frame_error("IDXGIResource::cast<ID3D11Texture2D>", e))?;

        let bitmap = self.copy_out(&texture)?;
        let dirty_rects = self.dirty_rects(&info)?;

        Ok(AcquireOutcome::Frame(RawFrame { bitmap, dirty_rects }))
    }

    fn release_frame(&mut self) {
        if self.holds_frame {
            self.holds_frame = false;
            unsafe {
                let _ = self.duplication.ReleaseFrame();
            }
        }
    }
}

impl Drop for DxgiOutput {
    fn drop(&mut self) {
        self.release_frame();
    }
}

/// Displays as reported by DXGI, named by their GDI device names
#[derive(Debug, Default)]
pub struct DxgiDisplaySource;

impl DisplaySource for DxgiDisplaySource {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>, CaptureError> {
        let mut displays = Vec::new();
        for_each_output(|_, _, desc| {
            let name = wide_to_string(&desc.DeviceName);
            let area = rect_of(&desc.DesktopCoordinates);
            let is_primary = area.x == 0 && area.y == 0;
            displays.push(DisplayInfo::new(name, area, is_primary).with_rotation(rotation_of(desc.Rotation)));
            true
        })?;

        if displays.is_empty() {
            return Err(CaptureError::EnumerationFailed("no desktop outputs".to_string()));
        }
        Ok(displays)
    }
}
