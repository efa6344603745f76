//! Pixel formats
//!
//! DRM fourcc codes on the Linux side, HAL pixel formats on the Android side.
//! The HAL names formats by memory byte order, DRM by little-endian word
//! order, so `ABGR8888` maps to `RGBA_8888` and `ARGB8888` to `BGRA_8888`.

use crate::hal::{
    HalPixelFormat, HAL_PIXEL_FORMAT_BGRA_8888, HAL_PIXEL_FORMAT_RGBA_8888,
    HAL_PIXEL_FORMAT_RGBX_8888, HAL_PIXEL_FORMAT_RGB_565,
};
use std::fmt;

pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// DRM fourcc format code
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const XRGB8888: Fourcc = Fourcc::from_chars(b"XR24");
    pub const ARGB8888: Fourcc = Fourcc::from_chars(b"AR24");
    pub const RGB565: Fourcc = Fourcc::from_chars(b"RG16");
    pub const XBGR8888: Fourcc = Fourcc::from_chars(b"XB24");
    pub const ABGR8888: Fourcc = Fourcc::from_chars(b"AB24");

    pub const fn from_chars(code: &[u8; 4]) -> Fourcc {
        Fourcc(
            code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24,
        )
    }

    pub fn is_known(self) -> bool {
        ALL_FORMATS.contains(&self)
    }

    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Fourcc::RGB565 => Some(2),
            Fourcc::XRGB8888 | Fourcc::ARGB8888 | Fourcc::XBGR8888 | Fourcc::ABGR8888 => Some(4),
            _ => None,
        }
    }

    /// Color depth as reported by the legacy framebuffer API
    pub fn depth(self) -> u32 {
        match self {
            Fourcc::RGB565 => 16,
            Fourcc::ARGB8888 | Fourcc::ABGR8888 => 32,
            _ => 24,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Fourcc::ARGB8888 | Fourcc::ABGR8888)
    }

    /// The same layout with the alpha channel ignored
    pub fn opaque(self) -> Fourcc {
        match self {
            Fourcc::ARGB8888 => Fourcc::XRGB8888,
            Fourcc::ABGR8888 => Fourcc::XBGR8888,
            other => other,
        }
    }

    /// Two formats are compatible when they only differ in whether the
    /// fourth channel carries alpha.
    pub fn is_compatible_with(self, other: Fourcc) -> bool {
        self.is_known() && self.opaque() == other.opaque()
    }

    pub fn to_hal(self) -> Option<HalPixelFormat> {
        match self {
            Fourcc::ABGR8888 => Some(HAL_PIXEL_FORMAT_RGBA_8888),
            Fourcc::XBGR8888 => Some(HAL_PIXEL_FORMAT_RGBX_8888),
            // gralloc has no BGRX, the alpha byte is simply ignored
            Fourcc::ARGB8888 | Fourcc::XRGB8888 => Some(HAL_PIXEL_FORMAT_BGRA_8888),
            Fourcc::RGB565 => Some(HAL_PIXEL_FORMAT_RGB_565),
            _ => None,
        }
    }

    pub fn from_hal(format: HalPixelFormat) -> Option<Fourcc> {
        match format {
            HAL_PIXEL_FORMAT_RGBA_8888 => Some(Fourcc::ABGR8888),
            HAL_PIXEL_FORMAT_RGBX_8888 => Some(Fourcc::XBGR8888),
            HAL_PIXEL_FORMAT_BGRA_8888 => Some(Fourcc::ARGB8888),
            HAL_PIXEL_FORMAT_RGB_565 => Some(Fourcc::RGB565),
            _ => None,
        }
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            let s: String = bytes.iter().map(|&b| b as char).collect();
            write!(f, "{}", s.trim_end())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Every format the shim can hand to the HAL
pub const ALL_FORMATS: [Fourcc; 5] = [
    Fourcc::XRGB8888,
    Fourcc::ARGB8888,
    Fourcc::XBGR8888,
    Fourcc::ABGR8888,
    Fourcc::RGB565,
];
