//! Shim configuration
//!
//! Read from a TOML file (`DRM_SHIM_CONFIG`, else `/etc/drm-hwcomposer-shim.toml`)
//! with a handful of environment overrides on top.

use crate::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/drm-hwcomposer-shim.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShimConfig {
    /// How long a HAL present may take before the device is declared lost
    pub watchdog_timeout_ms: u64,
    /// Page-flip completions queued per CRTC per subscriber before the
    /// producer blocks
    pub flip_queue_depth: usize,
    pub backpressure_timeout_ms: u64,
    pub dispatch_queue_depth: usize,
    pub overlay_planes: u32,
    pub cursor_size: u32,
    pub max_fb_dimension: u32,
    /// Capture a backtrace for every buffer object so leaks can be traced
    pub track_leaks: bool,
    pub log_filter: String,
    pub fallback_width: Option<u32>,
    pub fallback_height: Option<u32>,
    pub fallback_refresh: u32,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 2000,
            flip_queue_depth: 2,
            backpressure_timeout_ms: 50,
            dispatch_queue_depth: 64,
            overlay_planes: 3,
            cursor_size: 64,
            max_fb_dimension: 8192,
            track_leaks: false,
            log_filter: "info".to_string(),
            fallback_width: None,
            fallback_height: None,
            fallback_refresh: 60,
        }
    }
}

impl ShimConfig {
    /// Load from the configured file (if any) and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("DRM_SHIM_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading shim config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ShimConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Apply environment-style overrides. Malformed values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring malformed {}={:?}", key, value);
                    None
                }
            }
        }

        if let Some(ms) = parse("DRM_SHIM_WATCHDOG_MS", lookup("DRM_SHIM_WATCHDOG_MS")) {
            self.watchdog_timeout_ms = ms;
        }
        if let Some(raw) = lookup("DRM_SHIM_TRACK_LEAKS") {
            match raw.trim() {
                "1" | "true" | "yes" => self.track_leaks = true,
                "0" | "false" | "no" => self.track_leaks = false,
                other => warn!("Ignoring malformed DRM_SHIM_TRACK_LEAKS={:?}", other),
            }
        }
        if let Some(n) = parse("DRM_SHIM_OVERLAY_PLANES", lookup("DRM_SHIM_OVERLAY_PLANES")) {
            self.overlay_planes = n;
        }
        if let Some(w) = parse("FLICK_DISPLAY_WIDTH", lookup("FLICK_DISPLAY_WIDTH")) {
            self.fallback_width = Some(w);
        }
        if let Some(h) = parse("FLICK_DISPLAY_HEIGHT", lookup("FLICK_DISPLAY_HEIGHT")) {
            self.fallback_height = Some(h);
        }
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Mode to report for a display whose HAL config list is empty
    pub fn fallback_mode(&self) -> Option<(u32, u32, u32)> {
        match (self.fallback_width, self.fallback_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h, self.fallback_refresh.max(1))),
            _ => None,
        }
    }

    /// Planes created per CRTC: primary, overlays and cursor
    pub fn planes_per_crtc(&self) -> u32 {
        self.overlay_planes + 2
    }
}
