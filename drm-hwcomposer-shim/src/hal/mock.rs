//! Recording HAL bridge
//!
//! Backs every buffer with a memfd so the CPU GL backend can map it, records
//! each call, and exposes knobs for the failure modes real HALs exhibit:
//! layer limits, transient OOM, format substitution, stalled presents.

use super::*;
use crate::event::monotonic_ns;
use crate::format::ALL_FORMATS;
use crate::gbm_device::NativeBuffer;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum HalCall {
    EnumerateDisplays,
    GetModes(HalDisplayId),
    Allocate(HalBufferDesc),
    Reclaim,
    Import { width: u32, height: u32 },
    Retain(HalBufferHandle),
    Export(HalBufferHandle),
    Free {
        handle: HalBufferHandle,
        was_allocated: bool,
    },
    SetPower { display: HalDisplayId, on: bool },
    SetActiveConfig {
        display: HalDisplayId,
        config: HalConfigId,
    },
    SetVsync {
        display: HalDisplayId,
        enabled: bool,
    },
    Present { display: HalDisplayId, layers: usize },
}

impl HalCall {
    /// Calls with a visible effect on a panel
    pub fn touches_hardware(&self) -> bool {
        matches!(
            self,
            HalCall::SetPower { .. } | HalCall::SetActiveConfig { .. } | HalCall::Present { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PresentRecord {
    pub display: HalDisplayId,
    pub layers: Vec<HalLayer>,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct FreeRecord {
    pub handle: HalBufferHandle,
    pub was_allocated: bool,
    pub thread: Option<String>,
}

struct MockBuffer {
    fd: Option<OwnedFd>,
    refs: u32,
}

#[derive(Default)]
struct MockState {
    displays: BTreeMap<HalDisplayId, (HalDisplayInfo, Vec<DisplayMode>)>,
    calls: Vec<HalCall>,
    presents: Vec<PresentRecord>,
    frees: Vec<FreeRecord>,
    buffers: HashMap<HalBufferHandle, MockBuffer>,
    next_handle: u64,
    oom_failures: u32,
    substitutions: HashMap<HalPixelFormat, HalPixelFormat>,
    layer_limit: Option<usize>,
    hide_layer_limit: bool,
    hold_presents: bool,
    present_error: Option<HalError>,
    display_errors: HashMap<HalDisplayId, HalError>,
    reject_imports: bool,
}

#[derive(Default)]
pub struct MockHal {
    state: Mutex<MockState>,
    present_gate: Condvar,
    vsync: Mutex<HashMap<HalDisplayId, Arc<VsyncCallback>>>,
    hotplug: Mutex<Option<Arc<HotplugCallback>>>,
}

/// A 1080x2340 phone panel, the size the Flick shell falls back to
pub fn phone_display(id: HalDisplayId) -> (HalDisplayInfo, Vec<DisplayMode>) {
    let info = HalDisplayInfo {
        id,
        display_type: if id == 0 {
            DisplayType::Primary
        } else {
            DisplayType::External
        },
        name: format!("mock-{}", id),
        formats: ALL_FORMATS.to_vec(),
        max_device_layers: None,
    };
    let mut mode = DisplayMode::new(0, 1080, 2340, 60);
    mode.dpi_x = 400_000;
    mode.dpi_y = 400_000;
    let mut low = DisplayMode::new(1, 720, 1560, 60);
    low.dpi_x = 400_000;
    low.dpi_y = 400_000;
    (info, vec![mode, low])
}

fn memfd(size: usize) -> Result<OwnedFd, HalError> {
    // SAFETY: the name is a valid NUL-terminated string
    let fd = unsafe { libc::memfd_create(b"mock-gralloc\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(HalError::OutOfMemory);
    }
    // SAFETY: memfd_create returned a fresh descriptor we own
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: fd is valid for the duration of the call
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(HalError::OutOfMemory);
    }
    Ok(fd)
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A HAL with one phone panel as display 0
    pub fn with_primary() -> Arc<Self> {
        let hal = Self::new();
        let (info, modes) = phone_display(0);
        hal.add_display(info, modes);
        Arc::new(hal)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_display(&self, info: HalDisplayInfo, modes: Vec<DisplayMode>) {
        self.lock().displays.insert(info.id, (info, modes));
    }

    /// Plug a display in and notify the shim
    pub fn connect(&self, info: HalDisplayInfo, modes: Vec<DisplayMode>) {
        let id = info.id;
        self.add_display(info, modes);
        self.fire_hotplug(id, true);
    }

    /// Unplug a display and notify the shim
    pub fn disconnect(&self, display: HalDisplayId) {
        self.lock().displays.remove(&display);
        self.fire_hotplug(display, false);
    }

    pub fn fire_hotplug(&self, display: HalDisplayId, connected: bool) {
        let callback = self
            .hotplug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(display, connected);
        }
    }

    pub fn fire_vsync(&self, display: HalDisplayId, timestamp_ns: i64) {
        let callback = self
            .vsync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&display)
            .cloned();
        if let Some(callback) = callback {
            callback(display, timestamp_ns);
        }
    }

    pub fn has_vsync_callback(&self, display: HalDisplayId) -> bool {
        self.vsync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&display)
    }

    /// Presents with more layers than `limit` come back `Unsupported`
    pub fn set_layer_limit(&self, limit: Option<usize>) {
        self.lock().layer_limit = limit;
    }

    /// Report `Unsupported` without a layer-count hint
    pub fn hide_layer_limit(&self, hide: bool) {
        self.lock().hide_layer_limit = hide;
    }

    /// Fail the next `count` allocations with `OutOfMemory`
    pub fn fail_allocations(&self, count: u32) {
        self.lock().oom_failures = count;
    }

    pub fn substitute_format(&self, requested: HalPixelFormat, actual: HalPixelFormat) {
        self.lock().substitutions.insert(requested, actual);
    }

    pub fn reject_imports(&self, reject: bool) {
        self.lock().reject_imports = reject;
    }

    pub fn fail_presents_with(&self, error: Option<HalError>) {
        self.lock().present_error = error;
    }

    /// Like [`fail_presents_with`](Self::fail_presents_with) for one display
    pub fn fail_display_presents_with(&self, display: HalDisplayId, error: Option<HalError>) {
        let mut state = self.lock();
        match error {
            Some(e) => state.display_errors.insert(display, e),
            None => state.display_errors.remove(&display),
        };
    }

    /// Park every present until [`release_presents`](Self::release_presents)
    pub fn hold_presents(&self) {
        self.lock().hold_presents = true;
    }

    pub fn release_presents(&self) {
        self.lock().hold_presents = false;
        self.present_gate.notify_all();
    }

    pub fn calls(&self) -> Vec<HalCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn presents(&self) -> Vec<PresentRecord> {
        self.lock().presents.clone()
    }

    pub fn frees(&self) -> Vec<FreeRecord> {
        self.lock().frees.clone()
    }

    /// Presents that have entered the HAL, including ones still parked
    pub fn presents_started(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, HalCall::Present { .. }))
            .count()
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn is_live(&self, handle: HalBufferHandle) -> bool {
        self.lock().buffers.contains_key(&handle)
    }

    /// Create a buffer the way a HAL-side EGL window would, outside gralloc
    /// allocation by the shim
    pub fn create_native_buffer(
        &self,
        width: u32,
        height: u32,
        format: HalPixelFormat,
        usage: u64,
    ) -> Result<NativeBuffer, HalError> {
        let bpp = hal_format_bpp(format).ok_or(HalError::Unsupported)?;
        let stride = width.next_multiple_of(16);
        let fd = memfd((stride * bpp * height) as usize)?;
        let mut state = self.lock();
        let handle = state.new_handle();
        state.buffers.insert(
            handle,
            MockBuffer {
                fd: Some(fd),
                refs: 1,
            },
        );
        Ok(NativeBuffer {
            handle,
            width,
            height,
            format,
            stride,
            usage,
        })
    }

    /// Drop the reference a native buffer was created with
    pub fn destroy_native_buffer(&self, handle: HalBufferHandle) {
        self.lock().unref(handle);
    }
}

impl MockState {
    fn new_handle(&mut self) -> HalBufferHandle {
        self.next_handle += 1;
        HalBufferHandle(0x1000 + self.next_handle)
    }

    fn unref(&mut self, handle: HalBufferHandle) {
        if let Some(buffer) = self.buffers.get_mut(&handle) {
            buffer.refs = buffer.refs.saturating_sub(1);
            if buffer.refs == 0 {
                self.buffers.remove(&handle);
            }
        }
    }
}

impl HalBridge for MockHal {
    fn enumerate_displays(&self) -> Result<Vec<HalDisplayInfo>, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::EnumerateDisplays);
        Ok(state.displays.values().map(|(info, _)| info.clone()).collect())
    }

    fn get_modes(&self, display: HalDisplayId) -> Result<Vec<DisplayMode>, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::GetModes(display));
        state
            .displays
            .get(&display)
            .map(|(_, modes)| modes.clone())
            .ok_or(HalError::BadDisplay(display))
    }

    fn allocate_buffer(&self, desc: &HalBufferDesc) -> Result<HalAllocation, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::Allocate(*desc));
        if state.oom_failures > 0 {
            state.oom_failures -= 1;
            return Err(HalError::OutOfMemory);
        }

        let format = state
            .substitutions
            .get(&desc.format)
            .copied()
            .unwrap_or(desc.format);
        let bpp = hal_format_bpp(format).ok_or(HalError::Unsupported)?;
        let stride = desc.width.next_multiple_of(16);
        let protected = desc.usage & GRALLOC_USAGE_PROTECTED != 0;
        let backing = memfd((stride * bpp * desc.height) as usize)?;
        let fd = if protected {
            None
        } else {
            Some(backing.try_clone().map_err(|_| HalError::OutOfMemory)?)
        };

        let handle = state.new_handle();
        state.buffers.insert(
            handle,
            MockBuffer {
                fd: Some(backing),
                refs: 1,
            },
        );
        Ok(HalAllocation {
            handle,
            stride,
            format,
            fd,
        })
    }

    fn reclaim_transient(&self) {
        self.lock().calls.push(HalCall::Reclaim);
    }

    fn import_buffer(
        &self,
        fd: BorrowedFd<'_>,
        desc: &HalImportDesc,
    ) -> Result<HalBufferHandle, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::Import {
            width: desc.width,
            height: desc.height,
        });
        if state.reject_imports {
            return Err(HalError::Unsupported);
        }
        let owned = fd
            .try_clone_to_owned()
            .map_err(|e| HalError::BadParameter(e.to_string()))?;
        let handle = state.new_handle();
        state.buffers.insert(
            handle,
            MockBuffer {
                fd: Some(owned),
                refs: 1,
            },
        );
        Ok(handle)
    }

    fn retain_buffer(&self, handle: HalBufferHandle) -> Result<(), HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::Retain(handle));
        let buffer = state
            .buffers
            .get_mut(&handle)
            .ok_or(HalError::BadBuffer(handle))?;
        buffer.refs += 1;
        Ok(())
    }

    fn export_buffer(&self, handle: HalBufferHandle) -> Result<OwnedFd, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::Export(handle));
        let buffer = state.buffers.get(&handle).ok_or(HalError::BadBuffer(handle))?;
        match &buffer.fd {
            Some(fd) => fd
                .as_fd()
                .try_clone_to_owned()
                .map_err(|_| HalError::OutOfMemory),
            None => Err(HalError::Unsupported),
        }
    }

    fn free_buffer(&self, handle: HalBufferHandle, was_allocated: bool) {
        let mut state = self.lock();
        state.calls.push(HalCall::Free {
            handle,
            was_allocated,
        });
        state.frees.push(FreeRecord {
            handle,
            was_allocated,
            thread: std::thread::current().name().map(str::to_owned),
        });
        state.unref(handle);
    }

    fn set_power_mode(&self, display: HalDisplayId, on: bool) -> Result<(), HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::SetPower { display, on });
        if state.displays.contains_key(&display) {
            Ok(())
        } else {
            Err(HalError::BadDisplay(display))
        }
    }

    fn set_active_config(
        &self,
        display: HalDisplayId,
        config: HalConfigId,
    ) -> Result<(), HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::SetActiveConfig { display, config });
        match state.displays.get(&display) {
            Some((_, modes)) if modes.iter().any(|m| m.config_id == config) => Ok(()),
            Some(_) => Err(HalError::BadConfig),
            None => Err(HalError::BadDisplay(display)),
        }
    }

    fn set_vsync_enabled(&self, display: HalDisplayId, enabled: bool) -> Result<(), HalError> {
        self.lock().calls.push(HalCall::SetVsync { display, enabled });
        Ok(())
    }

    fn present(
        &self,
        display: HalDisplayId,
        layers: &[HalLayer],
    ) -> Result<PresentOutcome, HalError> {
        let mut state = self.lock();
        state.calls.push(HalCall::Present {
            display,
            layers: layers.len(),
        });
        while state.hold_presents {
            state = self
                .present_gate
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let mut record = PresentRecord {
            display,
            layers: layers.to_vec(),
            accepted: false,
        };
        if !state.displays.contains_key(&display) {
            state.presents.push(record);
            return Err(HalError::BadDisplay(display));
        }
        let failure = state
            .present_error
            .clone()
            .or_else(|| state.display_errors.get(&display).cloned());
        if let Some(err) = failure {
            state.presents.push(record);
            return Err(err);
        }
        if let Some(missing) = layers.iter().find(|l| !state.buffers.contains_key(&l.buffer)) {
            let handle = missing.buffer;
            state.presents.push(record);
            return Err(HalError::BadBuffer(handle));
        }
        if let Some(limit) = state.layer_limit {
            if layers.len() > limit {
                let max_layers = (!state.hide_layer_limit).then_some(limit);
                state.presents.push(record);
                return Ok(PresentOutcome::Unsupported { max_layers });
            }
        }

        record.accepted = true;
        state.presents.push(record);
        Ok(PresentOutcome::Presented {
            timestamp_ns: monotonic_ns(),
        })
    }

    fn register_vsync_callback(&self, display: HalDisplayId, callback: VsyncCallback) {
        self.vsync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(display, Arc::new(callback));
    }

    fn register_hotplug_callback(&self, callback: HotplugCallback) {
        *self.hotplug.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(format: HalPixelFormat) -> HalBufferDesc {
        HalBufferDesc {
            width: 100,
            height: 10,
            format,
            usage: GRALLOC_USAGE_HW_RENDER,
        }
    }

    #[test]
    fn test_allocation_is_backed_by_memfd() {
        let hal = MockHal::new();
        let alloc = hal.allocate_buffer(&desc(HAL_PIXEL_FORMAT_RGBA_8888)).unwrap();
        assert_eq!(alloc.stride, 112);
        let fd = alloc.fd.expect("unprotected buffers carry an fd");
        // SAFETY: fstat on a valid fd into a zeroed struct
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) }, 0);
        assert_eq!(st.st_size as u32, 112 * 4 * 10);

        hal.free_buffer(alloc.handle, true);
        assert_eq!(hal.live_buffers(), 0);
    }

    #[test]
    fn test_failure_knobs() {
        let hal = MockHal::new();
        hal.fail_allocations(1);
        assert_eq!(
            hal.allocate_buffer(&desc(HAL_PIXEL_FORMAT_RGBA_8888)).unwrap_err(),
            HalError::OutOfMemory
        );
        hal.substitute_format(HAL_PIXEL_FORMAT_RGBA_8888, HAL_PIXEL_FORMAT_RGBX_8888);
        let alloc = hal.allocate_buffer(&desc(HAL_PIXEL_FORMAT_RGBA_8888)).unwrap();
        assert_eq!(alloc.format, HAL_PIXEL_FORMAT_RGBX_8888);
    }

    #[test]
    fn test_layer_limit() {
        let hal = MockHal::with_primary();
        let alloc = hal.allocate_buffer(&desc(HAL_PIXEL_FORMAT_RGBA_8888)).unwrap();
        let layer = HalLayer {
            buffer: alloc.handle,
            source_crop: FloatRect::default(),
            display_frame: HalRect::default(),
            z_order: 0,
            blend: BlendMode::None,
            plane_alpha: 1.0,
        };
        hal.set_layer_limit(Some(1));
        assert!(matches!(
            hal.present(0, &[layer.clone(), layer.clone()]).unwrap(),
            PresentOutcome::Unsupported { max_layers: Some(1) }
        ));
        assert!(matches!(
            hal.present(0, &[layer]).unwrap(),
            PresentOutcome::Presented { .. }
        ));
        assert_eq!(hal.presents().iter().filter(|p| p.accepted).count(), 1);
    }

    #[test]
    fn test_native_buffer_refcount() {
        let hal = MockHal::new();
        let native = hal
            .create_native_buffer(64, 64, HAL_PIXEL_FORMAT_RGBA_8888, 0)
            .unwrap();
        hal.retain_buffer(native.handle).unwrap();
        hal.destroy_native_buffer(native.handle);
        assert!(hal.is_live(native.handle));
        hal.free_buffer(native.handle, false);
        assert!(!hal.is_live(native.handle));
    }
}
