//! Android HAL bridge
//!
//! The shim never calls hwcomposer or gralloc directly. Everything goes
//! through a [`HalBridge`], which marshals calls into the vendor HAL (via
//! libhybris on Droidian-style systems). Calls may block on HAL-internal
//! latency and callbacks may fire on any HAL thread, so implementations are
//! `Send + Sync` and must tolerate concurrent use.

use crate::format::Fourcc;
use std::os::fd::{BorrowedFd, OwnedFd};
use thiserror::Error;

#[cfg(any(test, feature = "mock-hal"))]
pub mod mock;

pub type HalDisplayId = u64;
pub type HalConfigId = u32;
pub type HalPixelFormat = i32;

// HWC2 error codes
pub const HWC2_ERROR_NONE: i32 = 0;
pub const HWC2_ERROR_BAD_CONFIG: i32 = 1;
pub const HWC2_ERROR_BAD_DISPLAY: i32 = 2;
pub const HWC2_ERROR_BAD_LAYER: i32 = 3;
pub const HWC2_ERROR_BAD_PARAMETER: i32 = 4;
pub const HWC2_ERROR_NO_RESOURCES: i32 = 6;
pub const HWC2_ERROR_NOT_VALIDATED: i32 = 7;
pub const HWC2_ERROR_UNSUPPORTED: i32 = 8;

// HAL pixel formats
pub const HAL_PIXEL_FORMAT_RGBA_8888: HalPixelFormat = 1;
pub const HAL_PIXEL_FORMAT_RGBX_8888: HalPixelFormat = 2;
pub const HAL_PIXEL_FORMAT_RGB_888: HalPixelFormat = 3;
pub const HAL_PIXEL_FORMAT_RGB_565: HalPixelFormat = 4;
pub const HAL_PIXEL_FORMAT_BGRA_8888: HalPixelFormat = 5;

// Gralloc usage flags
pub const GRALLOC_USAGE_SW_READ_RARELY: u64 = 0x0000_0002;
pub const GRALLOC_USAGE_SW_WRITE_OFTEN: u64 = 0x0000_0030;
pub const GRALLOC_USAGE_HW_TEXTURE: u64 = 0x0000_0100;
pub const GRALLOC_USAGE_HW_RENDER: u64 = 0x0000_0200;
pub const GRALLOC_USAGE_HW_COMPOSER: u64 = 0x0000_0800;
pub const GRALLOC_USAGE_HW_FB: u64 = 0x0000_1000;
pub const GRALLOC_USAGE_PROTECTED: u64 = 0x0000_4000;

/// Bytes per pixel of a HAL format, for stride math
pub fn hal_format_bpp(format: HalPixelFormat) -> Option<u32> {
    match format {
        HAL_PIXEL_FORMAT_RGBA_8888 | HAL_PIXEL_FORMAT_RGBX_8888 | HAL_PIXEL_FORMAT_BGRA_8888 => {
            Some(4)
        }
        HAL_PIXEL_FORMAT_RGB_888 => Some(3),
        HAL_PIXEL_FORMAT_RGB_565 => Some(2),
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("operation unsupported")]
    Unsupported,

    #[error("bad display {0}")]
    BadDisplay(HalDisplayId),

    #[error("bad config")]
    BadConfig,

    #[error("bad buffer handle {0:?}")]
    BadBuffer(HalBufferHandle),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("HAL service died: {0}")]
    Dead(String),

    #[error("HWC2 error {0}")]
    Code(i32),
}

impl HalError {
    /// Map an HWC2 return code; `None` for `HWC2_ERROR_NONE`
    pub fn from_hwc2(code: i32, display: HalDisplayId) -> Option<HalError> {
        match code {
            HWC2_ERROR_NONE => None,
            HWC2_ERROR_BAD_CONFIG => Some(HalError::BadConfig),
            HWC2_ERROR_BAD_DISPLAY => Some(HalError::BadDisplay(display)),
            HWC2_ERROR_BAD_LAYER | HWC2_ERROR_BAD_PARAMETER => {
                Some(HalError::BadParameter(format!("HWC2 error {}", code)))
            }
            HWC2_ERROR_NO_RESOURCES => Some(HalError::OutOfMemory),
            HWC2_ERROR_UNSUPPORTED => Some(HalError::Unsupported),
            other => Some(HalError::Code(other)),
        }
    }

    /// Errors after which the HAL cannot be trusted for further work
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::Dead(_))
    }
}

/// Opaque HAL-side buffer handle (a gralloc `buffer_handle_t` in the real bridge)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HalBufferHandle(pub u64);

/// Display types from hwcomposer
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    Primary = 0,
    External = 1,
    Virtual = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HalDisplayInfo {
    pub id: HalDisplayId,
    pub display_type: DisplayType,
    pub name: String,
    /// Formats the display can scan out directly
    pub formats: Vec<Fourcc>,
    /// Device layer limit, when the HAL advertises one up front
    pub max_device_layers: Option<usize>,
}

/// Display mode information
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMode {
    pub config_id: HalConfigId,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32, // In Hz
    pub vsync_period: u64, // In nanoseconds
    /// Dots per thousand inches, 0 when unknown
    pub dpi_x: u32,
    pub dpi_y: u32,
}

impl DisplayMode {
    pub fn new(config_id: HalConfigId, width: u32, height: u32, refresh_rate: u32) -> Self {
        Self {
            config_id,
            width,
            height,
            refresh_rate,
            vsync_period: 1_000_000_000 / u64::from(refresh_rate.max(1)),
            dpi_x: 0,
            dpi_y: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalBufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: HalPixelFormat,
    pub usage: u64,
}

#[derive(Debug)]
pub struct HalAllocation {
    pub handle: HalBufferHandle,
    /// Row stride in pixels, as gralloc reports it
    pub stride: u32,
    /// The format actually allocated, which may differ from the request
    pub format: HalPixelFormat,
    /// dma-buf fd, absent for protected allocations
    pub fd: Option<OwnedFd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalImportDesc {
    pub width: u32,
    pub height: u32,
    pub format: HalPixelFormat,
    /// Row stride in bytes
    pub stride: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FloatRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FloatRect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HalRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    None,
    Premultiplied,
    Coverage,
}

/// One layer of a present call
#[derive(Debug, Clone, PartialEq)]
pub struct HalLayer {
    pub buffer: HalBufferHandle,
    pub source_crop: FloatRect,
    pub display_frame: HalRect,
    pub z_order: u32,
    pub blend: BlendMode,
    pub plane_alpha: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { timestamp_ns: u64 },
    /// The layer set cannot be composited by the device; `max_layers` is the
    /// HAL's hint for how many it could take
    Unsupported { max_layers: Option<usize> },
}

pub type VsyncCallback = Box<dyn Fn(HalDisplayId, i64) + Send + Sync>;
pub type HotplugCallback = Box<dyn Fn(HalDisplayId, bool) + Send + Sync>;

/// Everything the shim needs from hwcomposer and gralloc
pub trait HalBridge: Send + Sync {
    fn enumerate_displays(&self) -> Result<Vec<HalDisplayInfo>, HalError>;

    /// Modes of a display, the active one first
    fn get_modes(&self, display: HalDisplayId) -> Result<Vec<DisplayMode>, HalError>;

    fn allocate_buffer(&self, desc: &HalBufferDesc) -> Result<HalAllocation, HalError>;

    /// Ask the HAL to drop caches it can rebuild, before retrying an allocation
    fn reclaim_transient(&self) {}

    fn import_buffer(
        &self,
        fd: BorrowedFd<'_>,
        desc: &HalImportDesc,
    ) -> Result<HalBufferHandle, HalError>;

    /// Take an extra reference on a buffer the HAL created itself
    fn retain_buffer(&self, handle: HalBufferHandle) -> Result<(), HalError>;

    fn export_buffer(&self, handle: HalBufferHandle) -> Result<OwnedFd, HalError>;

    /// Drop the shim's reference. `was_allocated` tells allocations apart from
    /// imports and retains, which gralloc releases differently.
    fn free_buffer(&self, handle: HalBufferHandle, was_allocated: bool);

    fn set_power_mode(&self, display: HalDisplayId, on: bool) -> Result<(), HalError>;

    fn set_active_config(&self, display: HalDisplayId, config: HalConfigId)
        -> Result<(), HalError>;

    fn set_vsync_enabled(&self, display: HalDisplayId, enabled: bool) -> Result<(), HalError>;

    /// Validate and present one frame (set layers, validate, accept, present)
    fn present(&self, display: HalDisplayId, layers: &[HalLayer])
        -> Result<PresentOutcome, HalError>;

    fn register_vsync_callback(&self, display: HalDisplayId, callback: VsyncCallback);

    fn register_hotplug_callback(&self, callback: HotplugCallback);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hwc2_error_mapping() {
        assert_eq!(HalError::from_hwc2(HWC2_ERROR_NONE, 0), None);
        assert_eq!(
            HalError::from_hwc2(HWC2_ERROR_BAD_DISPLAY, 3),
            Some(HalError::BadDisplay(3))
        );
        assert_eq!(
            HalError::from_hwc2(HWC2_ERROR_NO_RESOURCES, 0),
            Some(HalError::OutOfMemory)
        );
        assert_eq!(HalError::from_hwc2(42, 0), Some(HalError::Code(42)));
        assert!(HalError::Dead("binder".into()).is_fatal());
    }

    #[test]
    fn test_display_mode_vsync_period() {
        let mode = DisplayMode::new(0, 1080, 2340, 60);
        assert_eq!(mode.vsync_period, 16_666_666);
    }
}
