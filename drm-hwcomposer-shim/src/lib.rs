//! DRM/KMS Shim for Android hwcomposer
//!
//! This library presents a DRM/KMS and GBM-compatible device whose displays,
//! planes and buffers are backed by Android's hwcomposer and gralloc HALs.
//! Standard Wayland compositors can then drive Android-based Linux phones
//! (Droidian, Mobian on Android devices, etc.) through the APIs they already
//! speak.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Wayland Compositor (any)                       │
//! │         (Flick, Phosh, Plasma Mobile, etc.)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                Rust API or libdrm/libgbm C API
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              drm-hwcomposer-shim                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │ Object model│  │ GBM Device  │  │ EGL bridge          │  │
//! │  │ + commits   │  │ (gralloc)   │  │ (client composition)│  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌──────────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Present workers      │  │ Dispatch thread (vsync,     │  │
//! │  │ (one per CRTC)       │  │ hotplug, events, watchdog)  │  │
//! │  └──────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     HalBridge trait
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Android HAL (hwcomposer, gralloc)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use drm_hwcomposer_shim::{HwcDrmDevice, ShimConfig};
//!
//! let device = HwcDrmDevice::open(hal, gl, ShimConfig::load()?)?;
//! let events = device.subscribe()?;
//! // Poll events.as_raw_fd() alongside the compositor's other sources
//! ```

pub mod c_api;
pub mod commit;
pub mod config;
mod dispatch;
pub mod drm_device;
pub mod egl;
pub mod error;
pub mod event;
pub mod format;
pub mod gbm_device;
pub mod hal;
pub mod hotplug;
pub mod logging;
pub mod mode;
pub mod model;
pub mod property;
mod worker;

pub use c_api::drm_hwcomposer_shim_register_device;
pub use commit::{CommitRequest, CommitResult, Composition, CrtcOutcome, PlaneUpdate};
pub use config::ShimConfig;
pub use drm_device::{HwcDrmDevice, ShutdownReport};
pub use egl::{CpuGlBackend, EglBridge, GlBackend};
pub use error::{CommitError, DeviceError, Error};
pub use event::{EventKind, EventRecord, EventSource};
pub use format::Fourcc;
pub use gbm_device::{BufferObject, HwcGbmDevice, HwcGbmSurface};
pub use hal::HalBridge;
pub use mode::ModeInfo;
pub use model::{DrmObject, ObjectId, Rect, SrcRect};
pub use property::Prop;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
