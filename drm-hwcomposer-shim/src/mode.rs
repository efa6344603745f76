//! Display modes in kernel `drm_mode_modeinfo` form

use crate::hal::DisplayMode;

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;
pub const DRM_MODE_TYPE_DRIVER: u32 = 1 << 6;
pub const DRM_DISPLAY_MODE_LEN: usize = 32;

/// Size of `struct drm_mode_modeinfo`, which is what a MODE_ID blob holds
pub const MODE_INFO_SIZE: usize = 68;

/// DRM mode info (matching kernel's drm_mode_modeinfo)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl ModeInfo {
    /// Synthesize kernel timings for a HAL config. hwcomposer only reports
    /// size and refresh, so the blanking intervals are made up.
    pub fn from_display_mode(mode: &DisplayMode, preferred: bool) -> Self {
        let refresh = mode.refresh_rate;
        let hdisplay = mode.width.min(u32::from(u16::MAX - 200)) as u16;
        let vdisplay = mode.height.min(u32::from(u16::MAX - 50)) as u16;

        let htotal = hdisplay + 200; // Add blanking
        let vtotal = vdisplay + 50;
        let clock = (u64::from(htotal) * u64::from(vtotal) * u64::from(refresh) / 1000) as u32;

        let mut mode_type = DRM_MODE_TYPE_DRIVER;
        if preferred {
            mode_type |= DRM_MODE_TYPE_PREFERRED;
        }

        ModeInfo {
            clock,
            hdisplay,
            hsync_start: hdisplay + 50,
            hsync_end: hdisplay + 100,
            htotal,
            hskew: 0,
            vdisplay,
            vsync_start: vdisplay + 10,
            vsync_end: vdisplay + 20,
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: 0,
            mode_type,
            name: format!("{}x{}@{}", hdisplay, vdisplay, refresh),
        }
    }

    pub fn is_preferred(&self) -> bool {
        self.mode_type & DRM_MODE_TYPE_PREFERRED != 0
    }

    /// Same visible timing, ignoring the preferred flag and name
    pub fn same_timing(&self, other: &ModeInfo) -> bool {
        self.hdisplay == other.hdisplay
            && self.vdisplay == other.vdisplay
            && self.vrefresh == other.vrefresh
    }

    pub fn to_bytes(&self) -> [u8; MODE_INFO_SIZE] {
        let mut out = [0u8; MODE_INFO_SIZE];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&self.clock.to_ne_bytes());
        for v in [
            self.hdisplay,
            self.hsync_start,
            self.hsync_end,
            self.htotal,
            self.hskew,
            self.vdisplay,
            self.vsync_start,
            self.vsync_end,
            self.vtotal,
            self.vscan,
        ] {
            put(&v.to_ne_bytes());
        }
        put(&self.vrefresh.to_ne_bytes());
        put(&self.flags.to_ne_bytes());
        put(&self.mode_type.to_ne_bytes());
        let mut name = [0u8; DRM_DISPLAY_MODE_LEN];
        let len = self.name.len().min(DRM_DISPLAY_MODE_LEN - 1);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        put(&name);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<ModeInfo> {
        if bytes.len() != MODE_INFO_SIZE {
            return None;
        }
        let u16_at = |i: usize| u16::from_ne_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let name_bytes = &bytes[36..];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let mode = ModeInfo {
            clock: u32_at(0),
            hdisplay: u16_at(4),
            hsync_start: u16_at(6),
            hsync_end: u16_at(8),
            htotal: u16_at(10),
            hskew: u16_at(12),
            vdisplay: u16_at(14),
            vsync_start: u16_at(16),
            vsync_end: u16_at(18),
            vtotal: u16_at(20),
            vscan: u16_at(22),
            vrefresh: u32_at(24),
            flags: u32_at(28),
            mode_type: u32_at(32),
            name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
        };
        (mode.hdisplay > 0 && mode.vdisplay > 0).then_some(mode)
    }
}

/// Physical size in millimetres from the HAL's DPI (dots per 1000 inches).
/// Assumes ~400 DPI, typical for a phone, when the HAL does not say.
pub fn physical_size_mm(mode: &DisplayMode) -> (u32, u32) {
    let dpi = |raw: u32| {
        if raw > 0 {
            raw as f32 / 1000.0
        } else {
            400.0
        }
    };
    (
        (mode.width as f32 * 25.4 / dpi(mode.dpi_x)) as u32,
        (mode.height as f32 * 25.4 / dpi(mode.dpi_y)) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_timings() {
        let mode = ModeInfo::from_display_mode(&DisplayMode::new(0, 1080, 2340, 60), true);
        assert_eq!(mode.htotal, 1280);
        assert_eq!(mode.vtotal, 2390);
        assert_eq!(mode.clock, 1280 * 2390 * 60 / 1000);
        assert_eq!(mode.name, "1080x2340@60");
        assert!(mode.is_preferred());
    }

    #[test]
    fn test_blob_layout() {
        let mode = ModeInfo::from_display_mode(&DisplayMode::new(0, 720, 1440, 90), false);
        let bytes = mode.to_bytes();
        assert_eq!(u16::from_ne_bytes([bytes[4], bytes[5]]), 720);
        assert_eq!(u32::from_ne_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]), 90);
        assert_eq!(&bytes[36..48], b"720x1440@90\0");
        assert_eq!(ModeInfo::from_bytes(&bytes), Some(mode));
        assert_eq!(ModeInfo::from_bytes(&bytes[..60]), None);
        assert_eq!(ModeInfo::from_bytes(&[0u8; MODE_INFO_SIZE]), None);
    }

    #[test]
    fn test_physical_size() {
        let mut mode = DisplayMode::new(0, 1080, 2340, 60);
        assert_eq!(physical_size_mm(&mode), (68, 148));
        mode.dpi_x = 540_000;
        mode.dpi_y = 540_000;
        assert_eq!(physical_size_mm(&mode), (50, 110));
    }
}
