//! C API matching libgbm and libdrm
//!
//! Clients built against libgbm/libdrm call these entry points. They all act
//! on the device handed to [`drm_hwcomposer_shim_register_device`]; the
//! file descriptor arguments libdrm passes around are accepted and ignored.
//! Failures are reported as negative errno values (or null pointers where
//! libdrm returns pointers).

#![allow(non_camel_case_types, non_snake_case, clippy::missing_safety_doc)]

use crate::commit::{CommitRequest, CommitResult};
use crate::config::ShimConfig;
use crate::drm_device::{lock, HwcDrmDevice};
use crate::error::Error;
use crate::event::{EventKind, EventRecord, EventSource};
use crate::format::{Fourcc, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR};
use crate::gbm_device::{gbm_usage, BufferObject, ImportMetadata};
use crate::logging;
use crate::mode::ModeInfo;
use crate::model::{Connection, DrmObject, ObjectId};
use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_uint, c_void};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd};
use std::ptr;
use std::sync::{Arc, Mutex, Once};
use tracing::{debug, error, info, warn};

pub const GBM_BO_USE_SCANOUT: u32 = gbm_usage::GBM_BO_USE_SCANOUT;
pub const GBM_BO_USE_CURSOR: u32 = gbm_usage::GBM_BO_USE_CURSOR;
pub const GBM_BO_USE_RENDERING: u32 = gbm_usage::GBM_BO_USE_RENDERING;
pub const GBM_BO_USE_WRITE: u32 = gbm_usage::GBM_BO_USE_WRITE;
pub const GBM_BO_USE_LINEAR: u32 = gbm_usage::GBM_BO_USE_LINEAR;

pub const GBM_FORMAT_XRGB8888: u32 = Fourcc::XRGB8888.0;
pub const GBM_FORMAT_ARGB8888: u32 = Fourcc::ARGB8888.0;
pub const GBM_FORMAT_RGB565: u32 = Fourcc::RGB565.0;
pub const GBM_FORMAT_XBGR8888: u32 = Fourcc::XBGR8888.0;
pub const GBM_FORMAT_ABGR8888: u32 = Fourcc::ABGR8888.0;

pub const GBM_BO_IMPORT_FD: u32 = 0x5503;
pub const GBM_BO_IMPORT_FD_MODIFIER: u32 = 0x5504;

pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_MODE_DISCONNECTED: u32 = 2;
pub const DRM_MODE_UNKNOWNCONNECTION: u32 = 3;

pub const DRM_MODE_OBJECT_ANY: u32 = 0;

const BACKEND_NAME: &[u8] = b"drm-hwcomposer-shim\0";

// =============================================================================
// Global state
// =============================================================================

struct Registry {
    device: Option<Arc<HwcDrmDevice>>,
    /// Subscriber behind `drm_hwcomposer_shim_event_fd` and `drmHandleEvent`
    events: Option<Arc<EventSource>>,
    /// GEM-style handles given out by `gbm_bo_get_handle`
    handles: BTreeMap<u32, BufferObject>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    device: None,
    events: None,
    handles: BTreeMap::new(),
});

static LOGGING_INIT: Once = Once::new();

/// Make `device` the target of every C entry point
pub fn drm_hwcomposer_shim_register_device(device: Arc<HwcDrmDevice>) {
    let mut registry = lock(&REGISTRY);
    if registry.device.is_some() {
        warn!("Replacing the registered DRM device");
    }
    registry.device = Some(device);
    registry.events = None;
    registry.handles.clear();
}

/// Detach the registered device, dropping the handles the C side still holds
pub fn drm_hwcomposer_shim_unregister_device() -> Option<Arc<HwcDrmDevice>> {
    let mut registry = lock(&REGISTRY);
    registry.events = None;
    let handles = std::mem::take(&mut registry.handles);
    let device = registry.device.take();
    drop(registry);
    drop(handles);
    device
}

/// Set up logging. Returns 0 when a device is registered, `-ENODEV` otherwise.
#[no_mangle]
pub extern "C" fn drm_hwcomposer_shim_init() -> c_int {
    LOGGING_INIT.call_once(|| {
        let config = ShimConfig::load().unwrap_or_else(|e| {
            eprintln!("drm-hwcomposer-shim: ignoring config: {}", e);
            ShimConfig::default()
        });
        logging::init(&config);
        info!("drm-hwcomposer-shim C API initialized");
    });
    if device().is_some() {
        0
    } else {
        -libc::ENODEV
    }
}

fn device() -> Option<Arc<HwcDrmDevice>> {
    lock(&REGISTRY).device.clone()
}

fn event_source() -> Result<Arc<EventSource>, c_int> {
    let mut registry = lock(&REGISTRY);
    if let Some(events) = &registry.events {
        return Ok(events.clone());
    }
    let device = registry.device.clone().ok_or(-libc::ENODEV)?;
    let events = Arc::new(device.subscribe().map_err(|e| Error::from(e).errno())?);
    registry.events = Some(events.clone());
    Ok(events)
}

fn object_id(raw: u32) -> Option<ObjectId> {
    ObjectId::from_raw(raw)
}

fn errno_of(e: impl Into<Error>) -> c_int {
    e.into().errno()
}

/// Hand a vector to C. Empty vectors become null.
fn into_c_array<T>(items: Vec<T>) -> (*mut T, usize) {
    if items.is_empty() {
        return (ptr::null_mut(), 0);
    }
    let len = items.len();
    (Box::into_raw(items.into_boxed_slice()).cast::<T>(), len)
}

unsafe fn free_c_array<T>(items: *mut T, len: usize) {
    if !items.is_null() && len > 0 {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(items, len)));
    }
}

fn raw_ids(ids: &[ObjectId]) -> Vec<u32> {
    ids.iter().map(|id| id.raw()).collect()
}

// =============================================================================
// GBM
// =============================================================================

/// Opaque GBM device handle
pub struct gbm_device {
    drm: Arc<HwcDrmDevice>,
}

/// Opaque GBM buffer object handle
pub struct gbm_bo {
    bo: BufferObject,
    handle: u32,
    device: *mut gbm_device,
    user_data: *mut c_void,
    destroy_fn: Option<unsafe extern "C" fn(*mut gbm_bo, *mut c_void)>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union GbmBoHandle {
    pub ptr: *mut c_void,
    pub s32: i32,
    pub u32_: u32,
    pub s64: i64,
    pub u64_: u64,
}

#[repr(C)]
pub struct gbm_import_fd_data {
    pub fd: c_int,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: u32,
}

#[repr(C)]
pub struct gbm_import_fd_modifier_data {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub num_fds: u32,
    pub fds: [c_int; 4],
    pub strides: [c_int; 4],
    pub offsets: [c_int; 4],
    pub modifier: u64,
}

fn wrap_bo(device: *mut gbm_device, bo: BufferObject) -> *mut gbm_bo {
    // libdrm handles are 32-bit; buffer ids fit until 4G allocations
    let handle = bo.id() as u32;
    lock(&REGISTRY).handles.insert(handle, bo.retain());
    Box::into_raw(Box::new(gbm_bo {
        bo,
        handle,
        device,
        user_data: ptr::null_mut(),
        destroy_fn: None,
    }))
}

/// Create a GBM device. The fd is ignored; buffers come from the registered device.
#[no_mangle]
pub unsafe extern "C" fn gbm_create_device(fd: c_int) -> *mut gbm_device {
    info!("gbm_create_device(fd={})", fd);
    drm_hwcomposer_shim_init();
    match device() {
        Some(drm) => Box::into_raw(Box::new(gbm_device { drm })),
        None => {
            error!("gbm_create_device: no DRM device registered");
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_device_destroy(device: *mut gbm_device) {
    if !device.is_null() {
        drop(Box::from_raw(device));
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_device_is_format_supported(
    device: *mut gbm_device,
    format: u32,
    usage: u32,
) -> c_int {
    let Some(device) = device.as_ref() else {
        return 0;
    };
    c_int::from(device.drm.gbm().is_format_supported(Fourcc(format), usage))
}

#[no_mangle]
pub unsafe extern "C" fn gbm_device_get_backend_name(_device: *mut gbm_device) -> *const c_char {
    BACKEND_NAME.as_ptr().cast()
}

/// Allocate a buffer object. gralloc may hand back a compatible format;
/// `gbm_bo_get_format` reports what was actually allocated.
#[no_mangle]
pub unsafe extern "C" fn gbm_bo_create(
    device: *mut gbm_device,
    width: u32,
    height: u32,
    format: u32,
    flags: u32,
) -> *mut gbm_bo {
    debug!("gbm_bo_create({}x{}, format={:?}, flags=0x{:x})", width, height, Fourcc(format), flags);
    let Some(dev) = device.as_ref() else {
        return ptr::null_mut();
    };
    match dev.drm.gbm().create_bo(width, height, Fourcc(format), flags) {
        Ok(allocation) => wrap_bo(device, allocation.accept()),
        Err(e) => {
            error!("gbm_bo_create failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// Only linear layouts exist; any other modifier list fails
#[no_mangle]
pub unsafe extern "C" fn gbm_bo_create_with_modifiers(
    device: *mut gbm_device,
    width: u32,
    height: u32,
    format: u32,
    modifiers: *const u64,
    count: c_uint,
) -> *mut gbm_bo {
    if !modifiers.is_null() && count > 0 {
        let modifiers = std::slice::from_raw_parts(modifiers, count as usize);
        let linear = modifiers
            .iter()
            .any(|&m| m == DRM_FORMAT_MOD_LINEAR || m == DRM_FORMAT_MOD_INVALID);
        if !linear {
            warn!("gbm_bo_create_with_modifiers: no linear modifier in {:x?}", modifiers);
            return ptr::null_mut();
        }
    }
    gbm_bo_create(device, width, height, format, GBM_BO_USE_RENDERING | GBM_BO_USE_SCANOUT)
}

/// Import a DMA-BUF. The caller keeps its fd.
#[no_mangle]
pub unsafe extern "C" fn gbm_bo_import(
    device: *mut gbm_device,
    type_: u32,
    buffer: *mut c_void,
    _usage: u32,
) -> *mut gbm_bo {
    let Some(dev) = device.as_ref() else {
        return ptr::null_mut();
    };
    if buffer.is_null() {
        return ptr::null_mut();
    }
    let (fd, meta) = match type_ {
        GBM_BO_IMPORT_FD => {
            let data = &*(buffer as *const gbm_import_fd_data);
            let meta = ImportMetadata {
                width: data.width,
                height: data.height,
                format: Fourcc(data.format),
                stride: data.stride,
                offset: 0,
                modifier: DRM_FORMAT_MOD_INVALID,
            };
            (data.fd, meta)
        }
        GBM_BO_IMPORT_FD_MODIFIER => {
            let data = &*(buffer as *const gbm_import_fd_modifier_data);
            if data.num_fds != 1 {
                warn!("gbm_bo_import: {} planes requested, only one is supported", data.num_fds);
                return ptr::null_mut();
            }
            let meta = ImportMetadata {
                width: data.width,
                height: data.height,
                format: Fourcc(data.format),
                stride: data.strides[0] as u32,
                offset: data.offsets[0] as u32,
                modifier: data.modifier,
            };
            (data.fds[0], meta)
        }
        other => {
            warn!("gbm_bo_import: unsupported import type 0x{:x}", other);
            return ptr::null_mut();
        }
    };
    if fd < 0 {
        return ptr::null_mut();
    }
    match dev.drm.gbm().import_dmabuf(BorrowedFd::borrow_raw(fd), &meta) {
        Ok(bo) => wrap_bo(device, bo),
        Err(e) => {
            error!("gbm_bo_import failed: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_destroy(bo: *mut gbm_bo) {
    if bo.is_null() {
        return;
    }
    let wrapper = Box::from_raw(bo);
    if let Some(destroy) = wrapper.destroy_fn {
        destroy(bo, wrapper.user_data);
    }
    let handle_ref = lock(&REGISTRY).handles.remove(&wrapper.handle);
    // Framebuffers may still hold the buffer; it is freed with its last reference
    drop(handle_ref);
    wrapper.bo.release();
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_width(bo: *mut gbm_bo) -> u32 {
    bo.as_ref().map_or(0, |b| b.bo.width())
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_height(bo: *mut gbm_bo) -> u32 {
    bo.as_ref().map_or(0, |b| b.bo.height())
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_stride(bo: *mut gbm_bo) -> u32 {
    bo.as_ref().map_or(0, |b| b.bo.stride())
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_format(bo: *mut gbm_bo) -> u32 {
    bo.as_ref().map_or(0, |b| b.bo.format().0)
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_bpp(bo: *mut gbm_bo) -> u32 {
    bo.as_ref()
        .and_then(|b| b.bo.format().bytes_per_pixel())
        .map_or(0, |bytes| bytes * 8)
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_modifier(bo: *mut gbm_bo) -> u64 {
    bo.as_ref().map_or(DRM_FORMAT_MOD_INVALID, |b| b.bo.modifier())
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_plane_count(bo: *mut gbm_bo) -> c_int {
    if bo.is_null() {
        0
    } else {
        1
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_offset(bo: *mut gbm_bo, plane: c_int) -> u32 {
    match bo.as_ref() {
        Some(b) if plane == 0 => b.bo.offset(),
        _ => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_device(bo: *mut gbm_bo) -> *mut gbm_device {
    bo.as_ref().map_or(ptr::null_mut(), |b| b.device)
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_handle(bo: *mut gbm_bo) -> GbmBoHandle {
    GbmBoHandle {
        u64_: bo.as_ref().map_or(0, |b| u64::from(b.handle)),
    }
}

/// Export as a new dma-buf fd owned by the caller, or -1
#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_fd(bo: *mut gbm_bo) -> c_int {
    let Some(b) = bo.as_ref() else {
        return -1;
    };
    let Some(dev) = b.device.as_ref() else {
        return -1;
    };
    match dev.drm.gbm().export(&b.bo) {
        Ok(fd) => fd.into_raw_fd(),
        Err(e) => {
            warn!("gbm_bo_get_fd: {}", e);
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_set_user_data(
    bo: *mut gbm_bo,
    data: *mut c_void,
    destroy_fn: Option<unsafe extern "C" fn(*mut gbm_bo, *mut c_void)>,
) {
    if let Some(b) = bo.as_mut() {
        b.user_data = data;
        b.destroy_fn = destroy_fn;
    }
}

#[no_mangle]
pub unsafe extern "C" fn gbm_bo_get_user_data(bo: *mut gbm_bo) -> *mut c_void {
    bo.as_ref().map_or(ptr::null_mut(), |b| b.user_data)
}

// =============================================================================
// DRM types (matching libdrm's xf86drmMode.h)
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy)]
pub struct drmModeModeInfo {
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
    pub type_: u32,
    pub name: [c_char; 32],
}

impl From<&ModeInfo> for drmModeModeInfo {
    fn from(mode: &ModeInfo) -> Self {
        let mut name = [0 as c_char; 32];
        for (dst, src) in name.iter_mut().zip(mode.name.bytes().take(31)) {
            *dst = src as c_char;
        }
        Self {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name,
        }
    }
}

#[repr(C)]
pub struct drmModeRes {
    pub count_fbs: c_int,
    pub fbs: *mut u32,
    pub count_crtcs: c_int,
    pub crtcs: *mut u32,
    pub count_connectors: c_int,
    pub connectors: *mut u32,
    pub count_encoders: c_int,
    pub encoders: *mut u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
pub struct drmModeConnector {
    pub connector_id: u32,
    pub encoder_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mmWidth: u32,
    pub mmHeight: u32,
    pub subpixel: u32,
    pub count_modes: c_int,
    pub modes: *mut drmModeModeInfo,
    pub count_props: c_int,
    pub props: *mut u32,
    pub prop_values: *mut u64,
    pub count_encoders: c_int,
    pub encoders: *mut u32,
}

#[repr(C)]
pub struct drmModeEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
pub struct drmModeCrtc {
    pub crtc_id: u32,
    pub buffer_id: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mode_valid: c_int,
    pub mode: drmModeModeInfo,
    pub gamma_size: c_int,
}

#[repr(C)]
pub struct drmModePlaneRes {
    pub count_planes: u32,
    pub planes: *mut u32,
}

#[repr(C)]
pub struct drmModePlane {
    pub count_formats: u32,
    pub formats: *mut u32,
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub crtc_x: u32,
    pub crtc_y: u32,
    pub x: u32,
    pub y: u32,
    pub possible_crtcs: u32,
    pub gamma_size: u32,
}

/// Opaque atomic request built up by `drmModeAtomicAddProperty`
pub struct drmModeAtomicReq {
    inner: CommitRequest,
}

pub type DrmVblankHandler =
    unsafe extern "C" fn(fd: c_int, sequence: c_uint, tv_sec: c_uint, tv_usec: c_uint, user_data: *mut c_void);
pub type DrmPageFlipHandler2 = unsafe extern "C" fn(
    fd: c_int,
    sequence: c_uint,
    tv_sec: c_uint,
    tv_usec: c_uint,
    crtc_id: c_uint,
    user_data: *mut c_void,
);

#[repr(C)]
pub struct drmEventContext {
    pub version: c_int,
    pub vblank_handler: Option<DrmVblankHandler>,
    pub page_flip_handler: Option<DrmVblankHandler>,
    pub page_flip_handler2: Option<DrmPageFlipHandler2>,
    pub sequence_handler: Option<unsafe extern "C" fn(c_int, u64, u64, u64)>,
}

fn connection_status(connection: Connection) -> u32 {
    match connection {
        Connection::Connected => DRM_MODE_CONNECTED,
        Connection::Disconnected => DRM_MODE_DISCONNECTED,
        Connection::Unknown => DRM_MODE_UNKNOWNCONNECTION,
    }
}

fn lookup(fn_name: &str, id: u32) -> Option<DrmObject> {
    let drm = device()?;
    match drm.get(id) {
        Ok(object) => Some(object),
        Err(e) => {
            debug!("{}({}): {}", fn_name, id, e);
            None
        }
    }
}

// =============================================================================
// DRM object queries
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn drmModeGetResources(fd: c_int) -> *mut drmModeRes {
    debug!("drmModeGetResources(fd={})", fd);
    let Some(drm) = device() else {
        return ptr::null_mut();
    };
    let res = drm.resources();
    let (fbs, count_fbs) = into_c_array(raw_ids(&res.fbs));
    let (crtcs, count_crtcs) = into_c_array(raw_ids(&res.crtcs));
    let (connectors, count_connectors) = into_c_array(raw_ids(&res.connectors));
    let (encoders, count_encoders) = into_c_array(raw_ids(&res.encoders));
    Box::into_raw(Box::new(drmModeRes {
        count_fbs: count_fbs as c_int,
        fbs,
        count_crtcs: count_crtcs as c_int,
        crtcs,
        count_connectors: count_connectors as c_int,
        connectors,
        count_encoders: count_encoders as c_int,
        encoders,
        min_width: res.min_width,
        max_width: res.max_width,
        min_height: res.min_height,
        max_height: res.max_height,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreeResources(res: *mut drmModeRes) {
    if res.is_null() {
        return;
    }
    let res = Box::from_raw(res);
    free_c_array(res.fbs, res.count_fbs as usize);
    free_c_array(res.crtcs, res.count_crtcs as usize);
    free_c_array(res.connectors, res.count_connectors as usize);
    free_c_array(res.encoders, res.count_encoders as usize);
}

#[no_mangle]
pub unsafe extern "C" fn drmModeGetConnector(fd: c_int, connector_id: u32) -> *mut drmModeConnector {
    debug!("drmModeGetConnector(fd={}, id={})", fd, connector_id);
    let Some(DrmObject::Connector(conn)) = lookup("drmModeGetConnector", connector_id) else {
        return ptr::null_mut();
    };
    let (modes, count_modes) = into_c_array(conn.modes.iter().map(drmModeModeInfo::from).collect());
    let (props, count_props) = into_c_array(conn.properties.iter().map(|p| p.id.raw()).collect());
    let (prop_values, _) = into_c_array(conn.properties.iter().map(|p| p.value).collect());
    let (encoders, count_encoders) = into_c_array(vec![conn.encoder_id.raw()]);
    Box::into_raw(Box::new(drmModeConnector {
        connector_id: conn.id.raw(),
        encoder_id: conn.encoder_id.raw(),
        connector_type: conn.connector_type,
        connector_type_id: conn.connector_type_id,
        connection: connection_status(conn.connection),
        mmWidth: conn.width_mm,
        mmHeight: conn.height_mm,
        subpixel: 0,
        count_modes: count_modes as c_int,
        modes,
        count_props: count_props as c_int,
        props,
        prop_values,
        count_encoders: count_encoders as c_int,
        encoders,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreeConnector(connector: *mut drmModeConnector) {
    if connector.is_null() {
        return;
    }
    let conn = Box::from_raw(connector);
    free_c_array(conn.modes, conn.count_modes as usize);
    free_c_array(conn.props, conn.count_props as usize);
    free_c_array(conn.prop_values, conn.count_props as usize);
    free_c_array(conn.encoders, conn.count_encoders as usize);
}

#[no_mangle]
pub unsafe extern "C" fn drmModeGetEncoder(fd: c_int, encoder_id: u32) -> *mut drmModeEncoder {
    debug!("drmModeGetEncoder(fd={}, id={})", fd, encoder_id);
    let Some(DrmObject::Encoder(enc)) = lookup("drmModeGetEncoder", encoder_id) else {
        return ptr::null_mut();
    };
    Box::into_raw(Box::new(drmModeEncoder {
        encoder_id: enc.id.raw(),
        encoder_type: enc.encoder_type,
        crtc_id: enc.crtc_id.map_or(0, ObjectId::raw),
        possible_crtcs: enc.possible_crtcs,
        possible_clones: enc.possible_clones,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreeEncoder(encoder: *mut drmModeEncoder) {
    if !encoder.is_null() {
        drop(Box::from_raw(encoder));
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmModeGetCrtc(fd: c_int, crtc_id: u32) -> *mut drmModeCrtc {
    debug!("drmModeGetCrtc(fd={}, id={})", fd, crtc_id);
    let Some(DrmObject::Crtc(crtc)) = lookup("drmModeGetCrtc", crtc_id) else {
        return ptr::null_mut();
    };
    let (mode, width, height) = match &crtc.mode {
        Some(m) => (
            drmModeModeInfo::from(m),
            u32::from(m.hdisplay),
            u32::from(m.vdisplay),
        ),
        None => (drmModeModeInfo::from(&ModeInfo::default()), 0, 0),
    };
    Box::into_raw(Box::new(drmModeCrtc {
        crtc_id: crtc.id.raw(),
        buffer_id: crtc.fb_id.map_or(0, ObjectId::raw),
        x: 0,
        y: 0,
        width,
        height,
        mode_valid: c_int::from(crtc.mode.is_some()),
        mode,
        gamma_size: crtc.gamma_size as c_int,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreeCrtc(crtc: *mut drmModeCrtc) {
    if !crtc.is_null() {
        drop(Box::from_raw(crtc));
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmModeGetPlaneResources(fd: c_int) -> *mut drmModePlaneRes {
    debug!("drmModeGetPlaneResources(fd={})", fd);
    let Some(drm) = device() else {
        return ptr::null_mut();
    };
    let (planes, count) = into_c_array(raw_ids(&drm.resources().planes));
    Box::into_raw(Box::new(drmModePlaneRes {
        count_planes: count as u32,
        planes,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreePlaneResources(res: *mut drmModePlaneRes) {
    if res.is_null() {
        return;
    }
    let res = Box::from_raw(res);
    free_c_array(res.planes, res.count_planes as usize);
}

#[no_mangle]
pub unsafe extern "C" fn drmModeGetPlane(fd: c_int, plane_id: u32) -> *mut drmModePlane {
    debug!("drmModeGetPlane(fd={}, id={})", fd, plane_id);
    let Some(DrmObject::Plane(plane)) = lookup("drmModeGetPlane", plane_id) else {
        return ptr::null_mut();
    };
    let (formats, count) = into_c_array(plane.formats.iter().map(|f| f.0).collect());
    Box::into_raw(Box::new(drmModePlane {
        count_formats: count as u32,
        formats,
        plane_id: plane.id.raw(),
        crtc_id: plane.crtc_id.map_or(0, ObjectId::raw),
        fb_id: plane.fb_id.map_or(0, ObjectId::raw),
        crtc_x: plane.dst.x.max(0) as u32,
        crtc_y: plane.dst.y.max(0) as u32,
        x: plane.src.x >> 16,
        y: plane.src.y >> 16,
        possible_crtcs: plane.possible_crtcs,
        gamma_size: 0,
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeFreePlane(plane: *mut drmModePlane) {
    if plane.is_null() {
        return;
    }
    let plane = Box::from_raw(plane);
    free_c_array(plane.formats, plane.count_formats as usize);
}

// =============================================================================
// Framebuffers, blobs and properties
// =============================================================================

/// Wrap the buffer behind `bo_handles[0]` as a framebuffer. `pitches[0]`
/// and `offsets[0]` must describe that buffer.
#[no_mangle]
pub unsafe extern "C" fn drmModeAddFB2(
    _fd: c_int,
    width: u32,
    height: u32,
    pixel_format: u32,
    bo_handles: *const u32,
    pitches: *const u32,
    offsets: *const u32,
    buf_id: *mut u32,
    _flags: u32,
) -> c_int {
    debug!("drmModeAddFB2({}x{}, format={:?})", width, height, Fourcc(pixel_format));
    if bo_handles.is_null() || pitches.is_null() || buf_id.is_null() {
        return -libc::EINVAL;
    }
    let pitch = *pitches;
    let offset = if offsets.is_null() { 0 } else { *offsets };
    let (drm, bo) = {
        let registry = lock(&REGISTRY);
        let Some(drm) = registry.device.clone() else {
            return -libc::ENODEV;
        };
        let Some(bo) = registry.handles.get(&*bo_handles).map(BufferObject::retain) else {
            return -libc::ENOENT;
        };
        (drm, bo)
    };
    if width > bo.width() || height > bo.height() {
        warn!(
            "drmModeAddFB2: {}x{} exceeds the {}x{} buffer",
            width,
            height,
            bo.width(),
            bo.height()
        );
        bo.release();
        return -libc::EINVAL;
    }
    if pitch != bo.stride() || offset != bo.offset() {
        warn!(
            "drmModeAddFB2: pitch {} offset {} do not match the buffer's {} and {}",
            pitch,
            offset,
            bo.stride(),
            bo.offset()
        );
        bo.release();
        return -libc::EINVAL;
    }
    let result = drm.add_framebuffer(&bo, Fourcc(pixel_format));
    bo.release();
    match result {
        Ok(fb) => {
            *buf_id = fb.raw();
            0
        }
        Err(e) => {
            warn!("drmModeAddFB2 failed: {}", e);
            e.errno()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmModeRmFB(_fd: c_int, fb_id: u32) -> c_int {
    debug!("drmModeRmFB(fb={})", fb_id);
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    match drm.remove_framebuffer(fb_id) {
        Ok(()) => 0,
        Err(e) => errno_of(e),
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmModeCreatePropertyBlob(
    _fd: c_int,
    data: *const c_void,
    size: usize,
    id: *mut u32,
) -> c_int {
    if id.is_null() || (data.is_null() && size > 0) {
        return -libc::EINVAL;
    }
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    let bytes = if size == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data.cast::<u8>(), size).to_vec()
    };
    match drm.create_blob(bytes) {
        Ok(blob) => {
            *id = blob.raw();
            0
        }
        Err(e) => e.errno(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmModeDestroyPropertyBlob(_fd: c_int, id: u32) -> c_int {
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    match drm.destroy_blob(id) {
        Ok(()) => 0,
        Err(e) => errno_of(e),
    }
}

/// Stage a property value. It reaches the display with the next atomic commit.
#[no_mangle]
pub unsafe extern "C" fn drmModeObjectSetProperty(
    _fd: c_int,
    object_id: u32,
    object_type: u32,
    property_id: u32,
    value: u64,
) -> c_int {
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    if object_type != DRM_MODE_OBJECT_ANY {
        match drm.get(object_id) {
            Ok(object) if object.object_type().drm_type() == object_type => {}
            Ok(_) => return -libc::EINVAL,
            Err(e) => return errno_of(e),
        }
    }
    match drm.set_property(object_id, property_id, value) {
        Ok(()) => 0,
        Err(e) => errno_of(e),
    }
}

// =============================================================================
// Atomic commits, page flips and events
// =============================================================================

#[no_mangle]
pub unsafe extern "C" fn drmModeAtomicAlloc() -> *mut drmModeAtomicReq {
    Box::into_raw(Box::new(drmModeAtomicReq {
        inner: CommitRequest::new(0),
    }))
}

#[no_mangle]
pub unsafe extern "C" fn drmModeAtomicFree(req: *mut drmModeAtomicReq) {
    if !req.is_null() {
        drop(Box::from_raw(req));
    }
}

/// Returns the number of properties in the request, or a negative errno
#[no_mangle]
pub unsafe extern "C" fn drmModeAtomicAddProperty(
    req: *mut drmModeAtomicReq,
    object_id: u32,
    property_id: u32,
    value: u64,
) -> c_int {
    let Some(req) = req.as_mut() else {
        return -libc::EINVAL;
    };
    req.inner.add_property(object_id, property_id, value);
    req.inner.len() as c_int
}

#[no_mangle]
pub unsafe extern "C" fn drmModeAtomicCommit(
    _fd: c_int,
    req: *mut drmModeAtomicReq,
    flags: u32,
    user_data: *mut c_void,
) -> c_int {
    let Some(req) = req.as_mut() else {
        return -libc::EINVAL;
    };
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    req.inner.flags = flags;
    req.inner.user_data = user_data as u64;
    match drm.commit(&req.inner) {
        Ok(CommitResult::Tested { predictions }) => {
            debug!("drmModeAtomicCommit: test passed, {:?}", predictions);
            0
        }
        Ok(_) => 0,
        Err(e) => {
            debug!("drmModeAtomicCommit failed: {}", e);
            e.errno()
        }
    }
}

/// Completion arrives as a page-flip event carrying `user_data`
#[no_mangle]
pub unsafe extern "C" fn drmModePageFlip(
    _fd: c_int,
    crtc_id: u32,
    fb_id: u32,
    _flags: u32,
    user_data: *mut c_void,
) -> c_int {
    let (Some(crtc), Some(fb)) = (object_id(crtc_id), object_id(fb_id)) else {
        return -libc::EINVAL;
    };
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    match drm.page_flip(crtc, fb, user_data as u64) {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn drmGetCap(_fd: c_int, capability: u64, value: *mut u64) -> c_int {
    if value.is_null() {
        return -libc::EINVAL;
    }
    let Some(drm) = device() else {
        return -libc::ENODEV;
    };
    match drm.get_cap(capability) {
        Some(v) => {
            *value = v;
            0
        }
        None => -libc::EINVAL,
    }
}

/// Pollable fd that is readable while `drmHandleEvent` has events to deliver
#[no_mangle]
pub extern "C" fn drm_hwcomposer_shim_event_fd() -> c_int {
    match event_source() {
        Ok(events) => events.as_raw_fd(),
        Err(errno) => errno,
    }
}

fn split_timestamp(timestamp_ns: u64) -> (c_uint, c_uint) {
    let secs = timestamp_ns / 1_000_000_000;
    let usecs = (timestamp_ns % 1_000_000_000) / 1_000;
    (secs as c_uint, usecs as c_uint)
}

/// Deliver every queued event to the handlers in `evctx`
#[no_mangle]
pub unsafe extern "C" fn drmHandleEvent(fd: c_int, evctx: *mut drmEventContext) -> c_int {
    let Some(ctx) = evctx.as_ref() else {
        return -libc::EINVAL;
    };
    let events = match event_source() {
        Ok(events) => events,
        Err(errno) => return errno,
    };
    // Handlers may call back into the API, so nothing is locked while they run
    let records: Vec<EventRecord> = std::iter::from_fn(|| events.try_next()).collect();
    let mut failed = 0;
    for record in records {
        let (sec, usec) = split_timestamp(record.timestamp_ns);
        let sequence = record.sequence as c_uint;
        let user_data = record.user_data as *mut c_void;
        match record.kind {
            EventKind::FlipComplete => {
                if let (true, Some(handler)) = (ctx.version >= 3, ctx.page_flip_handler2) {
                    handler(fd, sequence, sec, usec, record.crtc_id, user_data);
                } else if let Some(handler) = ctx.page_flip_handler {
                    handler(fd, sequence, sec, usec, user_data);
                }
            }
            EventKind::Vsync => {
                if let Some(handler) = ctx.vblank_handler {
                    handler(fd, sequence, sec, usec, ptr::null_mut());
                }
            }
            EventKind::CommitFailed => {
                warn!("Commit on CRTC {} failed, no flip event delivered", record.crtc_id);
                if let Some(e) = device().and_then(|d| d.take_async_failure()) {
                    if failed == 0 {
                        failed = e.errno();
                    }
                }
            }
            EventKind::DeviceLost => {
                error!("DRM device lost");
                return -libc::ENODEV;
            }
            EventKind::Hotplug => {
                info!("Display hotplug on CRTC {}", record.crtc_id);
            }
        }
    }
    failed
}
