//! GBM device implementation backed by Android gralloc
//!
//! Buffer objects are allocated or imported through the HAL bridge and carry
//! an explicit reference count. The last release hands the HAL buffer to a
//! reaper thread, so a compositor thread dropping a buffer never waits on a
//! gralloc teardown.

use crate::config::ShimConfig;
use crate::error::{AllocationError, ImportError};
use crate::format::{Fourcc, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR};
use crate::hal::{
    HalBridge, HalBufferDesc, HalBufferHandle, HalError, HalImportDesc, HalPixelFormat,
    GRALLOC_USAGE_HW_COMPOSER, GRALLOC_USAGE_HW_FB, GRALLOC_USAGE_HW_RENDER,
    GRALLOC_USAGE_HW_TEXTURE, GRALLOC_USAGE_PROTECTED, GRALLOC_USAGE_SW_READ_RARELY,
    GRALLOC_USAGE_SW_WRITE_OFTEN,
};
use crate::Result;
use crossbeam_channel::{unbounded, Sender};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// GBM buffer usage flags, as in `gbm.h`
pub mod gbm_usage {
    pub const GBM_BO_USE_SCANOUT: u32 = 1 << 0;
    pub const GBM_BO_USE_CURSOR: u32 = 1 << 1;
    pub const GBM_BO_USE_RENDERING: u32 = 1 << 2;
    pub const GBM_BO_USE_WRITE: u32 = 1 << 3;
    pub const GBM_BO_USE_LINEAR: u32 = 1 << 4;
    pub const GBM_BO_USE_PROTECTED: u32 = 1 << 5;
}

use gbm_usage::*;

/// Translate GBM usage into gralloc usage bits
pub fn usage_to_gralloc(usage: u32) -> u64 {
    let mut gralloc = 0;
    if usage & (GBM_BO_USE_SCANOUT | GBM_BO_USE_CURSOR) != 0 {
        gralloc |= GRALLOC_USAGE_HW_COMPOSER | GRALLOC_USAGE_HW_FB;
    }
    if usage & GBM_BO_USE_RENDERING != 0 {
        gralloc |= GRALLOC_USAGE_HW_RENDER | GRALLOC_USAGE_HW_TEXTURE;
    }
    if usage & GBM_BO_USE_WRITE != 0 {
        gralloc |= GRALLOC_USAGE_SW_WRITE_OFTEN;
    }
    if usage & GBM_BO_USE_LINEAR != 0 {
        // CPU access forces a linear layout on every gralloc we know of
        gralloc |= GRALLOC_USAGE_SW_READ_RARELY;
    }
    if usage & GBM_BO_USE_PROTECTED != 0 {
        gralloc |= GRALLOC_USAGE_PROTECTED;
    }
    gralloc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Allocated by the shim through gralloc
    Allocated,
    /// A Linux dma-buf imported into the HAL
    Imported,
    /// A HAL-side buffer (EGL window, camera) wrapped for Linux use
    Native,
}

/// A buffer created outside the shim on the HAL side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    pub handle: HalBufferHandle,
    pub width: u32,
    pub height: u32,
    pub format: HalPixelFormat,
    /// Row stride in pixels
    pub stride: u32,
    pub usage: u64,
}

/// Size of a dma-buf as the kernel reports it through `lseek(SEEK_END)`
fn dmabuf_size(fd: BorrowedFd<'_>) -> Option<u64> {
    let raw = fd.as_raw_fd();
    // SAFETY: lseek on a valid, borrowed fd
    let end = unsafe { libc::lseek(raw, 0, libc::SEEK_END) };
    if end < 0 {
        return None;
    }
    // SAFETY: as above; put the shared offset back where clients expect it
    unsafe { libc::lseek(raw, 0, libc::SEEK_SET) };
    u64::try_from(end).ok()
}

/// Rows must hold a full line of pixels and the last row must end inside
/// the buffer
fn check_import_layout(meta: &ImportMetadata, size: Option<u64>) -> std::result::Result<(), ImportError> {
    let bpp = meta.format.bytes_per_pixel().unwrap_or(4);
    let min_stride = u64::from(meta.width) * u64::from(bpp);
    if u64::from(meta.stride) < min_stride {
        return Err(ImportError::BadLayout(format!(
            "stride {} is below {} bytes for {} {:?} pixels",
            meta.stride, min_stride, meta.width, meta.format
        )));
    }
    let needed = u64::from(meta.offset) + u64::from(meta.stride) * u64::from(meta.height);
    match size {
        Some(size) if needed > size => Err(ImportError::BadLayout(format!(
            "offset {} + stride {} x {} rows needs {} bytes, buffer has {}",
            meta.offset, meta.stride, meta.height, needed, size
        ))),
        Some(_) => Ok(()),
        None => {
            debug!("Cannot size imported buffer; trusting offset {}", meta.offset);
            Ok(())
        }
    }
}

/// Layout of a dma-buf handed in by a Linux client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportMetadata {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub stride: u32,
    pub offset: u32,
    pub modifier: u64,
}

struct BoShared {
    id: u64,
    handle: HalBufferHandle,
    width: u32,
    height: u32,
    stride: u32,
    offset: u32,
    format: Fourcc,
    modifier: u64,
    usage: u32,
    origin: BufferOrigin,
    fd: Option<OwnedFd>,
    refs: AtomicUsize,
    freed: AtomicBool,
    allocator: Weak<AllocatorInner>,
}

/// A reference-counted handle to a gralloc buffer
///
/// Cloning is `retain`, dropping is `release`. The HAL buffer is freed
/// exactly once, after the last reference goes away.
pub struct BufferObject {
    shared: Arc<BoShared>,
}

impl BufferObject {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn width(&self) -> u32 {
        self.shared.width
    }

    pub fn height(&self) -> u32 {
        self.shared.height
    }

    /// Row stride in bytes
    pub fn stride(&self) -> u32 {
        self.shared.stride
    }

    pub fn offset(&self) -> u32 {
        self.shared.offset
    }

    pub fn format(&self) -> Fourcc {
        self.shared.format
    }

    pub fn modifier(&self) -> u64 {
        self.shared.modifier
    }

    pub fn usage(&self) -> u32 {
        self.shared.usage
    }

    pub fn origin(&self) -> BufferOrigin {
        self.shared.origin
    }

    pub fn hal_handle(&self) -> HalBufferHandle {
        self.shared.handle
    }

    /// The dma-buf backing this buffer, if the HAL exposes one
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.shared.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn is_protected(&self) -> bool {
        self.shared.usage & GBM_BO_USE_PROTECTED != 0
    }

    pub fn retain(&self) -> BufferObject {
        self.shared.refs.fetch_add(1, Ordering::Relaxed);
        BufferObject {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn release(self) {
        drop(self)
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Whether the HAL buffer has been handed back (possibly at shutdown
    /// while this handle was leaked)
    pub fn is_freed(&self) -> bool {
        self.shared.freed.load(Ordering::Acquire)
    }

    pub fn same_buffer(&self, other: &BufferObject) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Clone for BufferObject {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        match self.shared.allocator.upgrade() {
            Some(allocator) => allocator.schedule_free(&self.shared),
            None => warn!(
                "Buffer {} released after its allocator went away",
                self.shared.id
            ),
        }
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.shared.id)
            .field("size", &(self.shared.width, self.shared.height))
            .field("format", &self.shared.format)
            .field("origin", &self.shared.origin)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSubstitution {
    pub requested: Fourcc,
    pub actual: Fourcc,
}

/// Result of an allocation; the HAL may have picked a compatible format
/// other than the one requested, and the caller has to look.
#[must_use = "check `substitution` before assuming the requested format"]
#[derive(Debug)]
pub struct Allocation {
    pub bo: BufferObject,
    pub substitution: Option<FormatSubstitution>,
}

impl Allocation {
    /// The buffer, failing if the format was substituted
    pub fn exact(self) -> std::result::Result<BufferObject, AllocationError> {
        match self.substitution {
            Some(sub) => Err(AllocationError::FormatSubstituted {
                requested: sub.requested,
                actual: sub.actual,
            }),
            None => Ok(self.bo),
        }
    }

    /// The buffer, whatever compatible format it ended up in
    pub fn accept(self) -> BufferObject {
        if let Some(sub) = self.substitution {
            debug!(
                "Accepting {:?} in place of {:?} for buffer {}",
                sub.actual,
                sub.requested,
                self.bo.id()
            );
        }
        self.bo
    }
}

/// A buffer still alive when the allocator shut down
#[derive(Debug, Clone)]
pub struct LeakedBuffer {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub origin: BufferOrigin,
    pub refs: usize,
    pub backtrace: Option<String>,
}

struct LiveEntry {
    shared: Weak<BoShared>,
    backtrace: Option<Backtrace>,
}

struct FreeRequest {
    id: u64,
    handle: HalBufferHandle,
    was_allocated: bool,
}

struct AllocatorInner {
    hal: Arc<dyn HalBridge>,
    max_dimension: u32,
    track_leaks: bool,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveEntry>>,
    reaper: Mutex<Option<Sender<FreeRequest>>>,
    reaper_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AllocatorInner {
    fn register(
        self: &Arc<Self>,
        handle: HalBufferHandle,
        layout: BufferLayout,
        origin: BufferOrigin,
        fd: Option<OwnedFd>,
    ) -> BufferObject {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(BoShared {
            id,
            handle,
            width: layout.width,
            height: layout.height,
            stride: layout.stride,
            offset: layout.offset,
            format: layout.format,
            modifier: layout.modifier,
            usage: layout.usage,
            origin,
            fd,
            refs: AtomicUsize::new(1),
            freed: AtomicBool::new(false),
            allocator: Arc::downgrade(self),
        });
        let backtrace = self.track_leaks.then(Backtrace::force_capture);
        lock(&self.live).insert(
            id,
            LiveEntry {
                shared: Arc::downgrade(&shared),
                backtrace,
            },
        );
        debug!(
            "Buffer {} {}x{} {:?} ({:?}) handle {:?}",
            id, layout.width, layout.height, layout.format, origin, handle
        );
        BufferObject { shared }
    }

    /// The one path to a HAL free; runs at most once per buffer
    fn schedule_free(&self, shared: &BoShared) {
        if shared.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.live).remove(&shared.id);
        self.send_free(FreeRequest {
            id: shared.id,
            handle: shared.handle,
            was_allocated: shared.origin == BufferOrigin::Allocated,
        });
    }

    fn send_free(&self, request: FreeRequest) {
        let sender = lock(&self.reaper).clone();
        let request = match sender {
            Some(tx) => match tx.send(request) {
                Ok(()) => return,
                Err(err) => err.into_inner(),
            },
            None => request,
        };
        debug!("Reaper gone, freeing buffer {} inline", request.id);
        self.hal.free_buffer(request.handle, request.was_allocated);
    }

    fn shutdown(&self) -> Vec<LeakedBuffer> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let entries: Vec<LiveEntry> = lock(&self.live).drain().map(|(_, e)| e).collect();
        let mut leaked = Vec::new();
        for entry in entries {
            let Some(shared) = entry.shared.upgrade() else {
                continue;
            };
            let leak = LeakedBuffer {
                id: shared.id,
                width: shared.width,
                height: shared.height,
                format: shared.format,
                origin: shared.origin,
                refs: shared.refs.load(Ordering::Acquire),
                backtrace: entry.backtrace.map(|bt| bt.to_string()),
            };
            match &leak.backtrace {
                Some(bt) => warn!(
                    "Leaked buffer {} {}x{} {:?} ({} refs), allocated at:\n{}",
                    leak.id, leak.width, leak.height, leak.format, leak.refs, bt
                ),
                None => warn!(
                    "Leaked buffer {} {}x{} {:?} ({} refs)",
                    leak.id, leak.width, leak.height, leak.format, leak.refs
                ),
            }
            if !shared.freed.swap(true, Ordering::AcqRel) {
                self.send_free(FreeRequest {
                    id: shared.id,
                    handle: shared.handle,
                    was_allocated: shared.origin == BufferOrigin::Allocated,
                });
            }
            leaked.push(leak);
        }

        // Closing the channel lets the reaper drain and exit
        lock(&self.reaper).take();
        if let Some(thread) = lock(&self.reaper_thread).take() {
            if thread.join().is_err() {
                warn!("GBM reaper thread panicked");
            }
        }
        if leaked.is_empty() {
            info!("GBM allocator shut down cleanly");
        } else {
            warn!("GBM allocator shut down with {} leaked buffers", leaked.len());
        }
        leaked
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy)]
struct BufferLayout {
    width: u32,
    height: u32,
    stride: u32,
    offset: u32,
    format: Fourcc,
    modifier: u64,
    usage: u32,
}

fn map_import_error(err: HalError) -> ImportError {
    match err {
        HalError::Unsupported => {
            ImportError::Unsupported("memory type is not importable by the HAL".to_string())
        }
        other => ImportError::Hal(other),
    }
}

/// GBM device backed by Android gralloc
#[derive(Clone)]
pub struct HwcGbmDevice {
    inner: Arc<AllocatorInner>,
}

impl HwcGbmDevice {
    pub fn new(hal: Arc<dyn HalBridge>, config: &ShimConfig) -> Result<Self> {
        info!("Creating HwcGbmDevice backed by gralloc");

        let (tx, rx) = unbounded::<FreeRequest>();
        let reaper_hal = Arc::clone(&hal);
        let thread = std::thread::Builder::new()
            .name("gbm-reaper".to_string())
            .spawn(move || {
                for request in rx.iter() {
                    debug!("Freeing buffer {} ({:?})", request.id, request.handle);
                    reaper_hal.free_buffer(request.handle, request.was_allocated);
                }
            })?;

        Ok(Self {
            inner: Arc::new(AllocatorInner {
                hal,
                max_dimension: config.max_fb_dimension,
                track_leaks: config.track_leaks,
                next_id: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                reaper: Mutex::new(Some(tx)),
                reaper_thread: Mutex::new(Some(thread)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn hal(&self) -> &Arc<dyn HalBridge> {
        &self.inner.hal
    }

    pub fn max_dimension(&self) -> u32 {
        self.inner.max_dimension
    }

    pub fn is_format_supported(&self, format: Fourcc, _usage: u32) -> bool {
        format.to_hal().is_some()
    }

    /// Allocate a buffer object
    pub fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        usage: u32,
    ) -> std::result::Result<Allocation, AllocationError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AllocationError::DeviceClosed);
        }
        let max = self.inner.max_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(AllocationError::InvalidDimensions { width, height });
        }
        let hal_format = format
            .to_hal()
            .ok_or(AllocationError::UnsupportedFormat(format))?;

        info!("Allocating buffer {}x{} format {:?}", width, height, format);
        let desc = HalBufferDesc {
            width,
            height,
            format: hal_format,
            usage: usage_to_gralloc(usage),
        };
        let hal = &self.inner.hal;
        let allocation = match hal.allocate_buffer(&desc) {
            Ok(a) => a,
            Err(HalError::OutOfMemory) => {
                warn!("gralloc out of memory, reclaiming and retrying once");
                hal.reclaim_transient();
                hal.allocate_buffer(&desc).map_err(|e| match e {
                    HalError::OutOfMemory => AllocationError::OutOfMemory,
                    other => AllocationError::Hal(other),
                })?
            }
            Err(e) => return Err(AllocationError::Hal(e)),
        };

        let (actual, substitution) = if allocation.format == hal_format {
            (format, None)
        } else {
            match Fourcc::from_hal(allocation.format) {
                Some(actual) if actual.is_compatible_with(format) => {
                    warn!(
                        "gralloc substituted {:?} for requested {:?}",
                        actual, format
                    );
                    (
                        actual,
                        Some(FormatSubstitution {
                            requested: format,
                            actual,
                        }),
                    )
                }
                _ => {
                    self.inner.send_free(FreeRequest {
                        id: 0,
                        handle: allocation.handle,
                        was_allocated: true,
                    });
                    return Err(AllocationError::IncompatibleSubstitution {
                        requested: format,
                        actual: allocation.format,
                    });
                }
            }
        };

        // Both formats have a known size at this point
        let bpp = actual.bytes_per_pixel().unwrap_or(4);
        let layout = BufferLayout {
            width,
            height,
            stride: allocation.stride * bpp,
            offset: 0,
            format: actual,
            modifier: DRM_FORMAT_MOD_LINEAR,
            usage,
        };
        let bo = self
            .inner
            .register(allocation.handle, layout, BufferOrigin::Allocated, allocation.fd);
        Ok(Allocation { bo, substitution })
    }

    /// Import a DMA-BUF as a buffer object
    ///
    /// The fd is duplicated; the caller keeps ownership of the one it passed.
    pub fn import_dmabuf(
        &self,
        fd: BorrowedFd<'_>,
        meta: &ImportMetadata,
    ) -> std::result::Result<BufferObject, ImportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ImportError::DeviceClosed);
        }
        let unsupported = ImportError::UnsupportedFormat {
            format: meta.format,
            modifier: meta.modifier,
        };
        let Some(hal_format) = meta.format.to_hal() else {
            return Err(unsupported);
        };
        if meta.modifier != DRM_FORMAT_MOD_LINEAR && meta.modifier != DRM_FORMAT_MOD_INVALID {
            return Err(unsupported);
        }
        let max = self.inner.max_dimension;
        if meta.width == 0 || meta.height == 0 || meta.width > max || meta.height > max {
            return Err(ImportError::Unsupported(format!(
                "invalid dimensions {}x{}",
                meta.width, meta.height
            )));
        }

        debug!(
            "Importing DMA-BUF {}x{} {:?} stride {}",
            meta.width, meta.height, meta.format, meta.stride
        );
        let owned = fd.try_clone_to_owned().map_err(ImportError::BadFd)?;
        check_import_layout(meta, dmabuf_size(owned.as_fd()))?;
        let desc = HalImportDesc {
            width: meta.width,
            height: meta.height,
            format: hal_format,
            stride: meta.stride,
            offset: meta.offset,
        };
        let handle = self
            .inner
            .hal
            .import_buffer(owned.as_fd(), &desc)
            .map_err(map_import_error)?;

        let layout = BufferLayout {
            width: meta.width,
            height: meta.height,
            stride: meta.stride,
            offset: meta.offset,
            format: meta.format,
            modifier: DRM_FORMAT_MOD_LINEAR,
            usage: 0,
        };
        Ok(self
            .inner
            .register(handle, layout, BufferOrigin::Imported, Some(owned)))
    }

    /// Export a buffer as a fresh dma-buf fd owned by the caller
    pub fn export(&self, bo: &BufferObject) -> std::result::Result<OwnedFd, ImportError> {
        if bo.is_protected() {
            return Err(ImportError::Unsupported(
                "protected buffers cannot be exported".to_string(),
            ));
        }
        if bo.is_freed() {
            return Err(ImportError::DeviceClosed);
        }
        match bo.fd() {
            Some(fd) => fd.try_clone_to_owned().map_err(ImportError::BadFd),
            None => self
                .inner
                .hal
                .export_buffer(bo.hal_handle())
                .map_err(map_import_error),
        }
    }

    /// Wrap a HAL-created buffer so Linux clients can use it
    pub fn wrap_native(
        &self,
        native: &NativeBuffer,
    ) -> std::result::Result<BufferObject, ImportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ImportError::DeviceClosed);
        }
        let format = Fourcc::from_hal(native.format).ok_or_else(|| {
            ImportError::Unsupported(format!("HAL pixel format {}", native.format))
        })?;
        if native.usage & GRALLOC_USAGE_PROTECTED != 0 {
            return Err(ImportError::Unsupported(
                "protected buffers cannot be exported".to_string(),
            ));
        }

        let hal = &self.inner.hal;
        hal.retain_buffer(native.handle).map_err(map_import_error)?;
        let fd = match hal.export_buffer(native.handle) {
            Ok(fd) => fd,
            Err(e) => {
                hal.free_buffer(native.handle, false);
                return Err(map_import_error(e));
            }
        };

        let bpp = format.bytes_per_pixel().unwrap_or(4);
        let layout = BufferLayout {
            width: native.width,
            height: native.height,
            stride: native.stride * bpp,
            offset: 0,
            format,
            modifier: DRM_FORMAT_MOD_LINEAR,
            usage: GBM_BO_USE_RENDERING,
        };
        Ok(self
            .inner
            .register(native.handle, layout, BufferOrigin::Native, Some(fd)))
    }

    /// Create a surface for rendering
    pub fn create_surface(
        &self,
        width: u32,
        height: u32,
        format: Fourcc,
        usage: u32,
        buffer_count: usize,
    ) -> std::result::Result<HwcGbmSurface, AllocationError> {
        info!("Creating surface {}x{} with {} buffers", width, height, buffer_count);

        let mut slots = Vec::with_capacity(buffer_count.max(1));
        for _ in 0..buffer_count.max(1) {
            let bo = self.create_bo(width, height, format, usage)?.accept();
            slots.push(SurfaceSlot { bo, locked: false });
        }
        let format = slots[0].bo.format();
        Ok(HwcGbmSurface {
            width,
            height,
            format,
            slots,
            next: 0,
        })
    }

    /// Buffers currently alive
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.live).len()
    }

    /// Free every remaining buffer and stop the reaper. Buffers that still
    /// had references are reported as leaks.
    pub fn shutdown(&self) -> Vec<LeakedBuffer> {
        self.inner.shutdown()
    }
}

struct SurfaceSlot {
    bo: BufferObject,
    locked: bool,
}

/// GBM surface for rendering
pub struct HwcGbmSurface {
    width: u32,
    height: u32,
    format: Fourcc,
    slots: Vec<SurfaceSlot>,
    next: usize,
}

impl HwcGbmSurface {
    /// Lock the next free buffer for scanout. The surface keeps it out of
    /// rotation until [`release_buffer`](Self::release_buffer).
    pub fn lock_front_buffer(&mut self) -> Option<BufferObject> {
        let count = self.slots.len();
        for step in 0..count {
            let index = (self.next + step) % count;
            let slot = &mut self.slots[index];
            if !slot.locked {
                slot.locked = true;
                self.next = (index + 1) % count;
                return Some(slot.bo.retain());
            }
        }
        None
    }

    pub fn release_buffer(&mut self, bo: &BufferObject) -> bool {
        match self.slots.iter_mut().find(|s| s.bo.same_buffer(bo)) {
            Some(slot) if slot.locked => {
                slot.locked = false;
                true
            }
            _ => false,
        }
    }

    pub fn has_free_buffers(&self) -> bool {
        self.slots.iter().any(|s| !s.locked)
    }

    /// Get surface dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::{HalCall, MockHal};
    use crate::hal::{HAL_PIXEL_FORMAT_BGRA_8888, HAL_PIXEL_FORMAT_RGBA_8888, HAL_PIXEL_FORMAT_RGBX_8888, HAL_PIXEL_FORMAT_RGB_565};
    use std::time::{Duration, Instant};

    fn device() -> (Arc<MockHal>, HwcGbmDevice) {
        let hal = Arc::new(MockHal::new());
        let gbm = HwcGbmDevice::new(hal.clone(), &ShimConfig::default()).unwrap();
        (hal, gbm)
    }

    fn wait_for_frees(hal: &MockHal, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while hal.frees().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_create_bo_linear_stride() {
        let (_hal, gbm) = device();
        let bo = gbm
            .create_bo(100, 50, Fourcc::XRGB8888, GBM_BO_USE_SCANOUT)
            .unwrap()
            .exact()
            .unwrap();
        assert_eq!(bo.stride(), 112 * 4);
        assert_eq!(bo.modifier(), DRM_FORMAT_MOD_LINEAR);
        assert!(bo.fd().is_some());
        assert_eq!(gbm.outstanding(), 1);
    }

    #[test]
    fn test_last_release_frees_once_on_reaper() {
        let (hal, gbm) = device();
        let bo = gbm
            .create_bo(16, 16, Fourcc::ARGB8888, GBM_BO_USE_RENDERING)
            .unwrap()
            .accept();
        let second = bo.retain();
        assert_eq!(bo.ref_count(), 2);
        bo.release();
        assert!(hal.frees().is_empty());
        assert!(!second.is_freed());

        second.release();
        wait_for_frees(&hal, 1);
        let frees = hal.frees();
        assert_eq!(frees.len(), 1);
        assert!(frees[0].was_allocated);
        assert_eq!(frees[0].thread.as_deref(), Some("gbm-reaper"));
        assert_eq!(gbm.outstanding(), 0);
    }

    #[test]
    fn test_oom_retries_after_reclaim() {
        let (hal, gbm) = device();
        hal.fail_allocations(1);
        let bo = gbm.create_bo(8, 8, Fourcc::XRGB8888, 0).unwrap().accept();
        assert_eq!(bo.width(), 8);
        assert!(hal.calls().contains(&HalCall::Reclaim));

        hal.fail_allocations(2);
        assert_eq!(
            gbm.create_bo(8, 8, Fourcc::XRGB8888, 0).unwrap_err(),
            AllocationError::OutOfMemory
        );
    }

    #[test]
    fn test_substitution_is_reported() {
        let (hal, gbm) = device();
        hal.substitute_format(HAL_PIXEL_FORMAT_RGBA_8888, HAL_PIXEL_FORMAT_RGBX_8888);
        let alloc = gbm.create_bo(8, 8, Fourcc::ABGR8888, 0).unwrap();
        assert_eq!(
            alloc.substitution,
            Some(FormatSubstitution {
                requested: Fourcc::ABGR8888,
                actual: Fourcc::XBGR8888,
            })
        );
        assert_eq!(alloc.bo.format(), Fourcc::XBGR8888);
        assert!(matches!(
            alloc.exact(),
            Err(AllocationError::FormatSubstituted { .. })
        ));

        hal.substitute_format(HAL_PIXEL_FORMAT_BGRA_8888, HAL_PIXEL_FORMAT_RGB_565);
        assert!(matches!(
            gbm.create_bo(8, 8, Fourcc::ARGB8888, 0),
            Err(AllocationError::IncompatibleSubstitution { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let (_hal, gbm) = device();
        assert_eq!(
            gbm.create_bo(0, 8, Fourcc::XRGB8888, 0).unwrap_err(),
            AllocationError::InvalidDimensions { width: 0, height: 8 }
        );
        assert_eq!(
            gbm.create_bo(8, 8, Fourcc(0x1234), 0).unwrap_err(),
            AllocationError::UnsupportedFormat(Fourcc(0x1234))
        );
    }

    #[test]
    fn test_import_and_export() {
        let (hal, gbm) = device();
        let source = gbm.create_bo(32, 32, Fourcc::XRGB8888, 0).unwrap().accept();
        let fd = gbm.export(&source).unwrap();

        let meta = ImportMetadata {
            width: 32,
            height: 32,
            format: Fourcc::XRGB8888,
            stride: source.stride(),
            offset: 0,
            modifier: DRM_FORMAT_MOD_LINEAR,
        };
        let imported = gbm.import_dmabuf(fd.as_fd(), &meta).unwrap();
        assert_eq!(imported.origin(), BufferOrigin::Imported);

        let tiled = ImportMetadata {
            modifier: 0x0100_0000_0000_0001,
            ..meta
        };
        assert!(matches!(
            gbm.import_dmabuf(fd.as_fd(), &tiled),
            Err(ImportError::UnsupportedFormat { .. })
        ));

        hal.reject_imports(true);
        assert!(matches!(
            gbm.import_dmabuf(fd.as_fd(), &meta),
            Err(ImportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_import_rejects_bad_layout() {
        let (hal, gbm) = device();
        let source = gbm.create_bo(64, 64, Fourcc::ARGB8888, 0).unwrap().accept();
        let fd = gbm.export(&source).unwrap();
        let meta = ImportMetadata {
            width: 64,
            height: 64,
            format: Fourcc::ARGB8888,
            stride: source.stride(),
            offset: 0,
            modifier: DRM_FORMAT_MOD_LINEAR,
        };
        hal.clear_calls();

        let narrow = ImportMetadata { stride: 16, ..meta };
        assert!(matches!(
            gbm.import_dmabuf(fd.as_fd(), &narrow),
            Err(ImportError::BadLayout(_))
        ));
        let past_end = ImportMetadata { offset: 4096, ..meta };
        assert!(matches!(
            gbm.import_dmabuf(fd.as_fd(), &past_end),
            Err(ImportError::BadLayout(_))
        ));
        let too_tall = ImportMetadata { height: 65, ..meta };
        assert!(matches!(
            gbm.import_dmabuf(fd.as_fd(), &too_tall),
            Err(ImportError::BadLayout(_))
        ));
        // Rejected before the HAL sees anything
        assert!(hal.calls().is_empty());
        assert!(gbm.import_dmabuf(fd.as_fd(), &meta).is_ok());
    }

    #[test]
    fn test_protected_buffers_do_not_export() {
        let (_hal, gbm) = device();
        let bo = gbm
            .create_bo(8, 8, Fourcc::XRGB8888, GBM_BO_USE_PROTECTED)
            .unwrap()
            .accept();
        assert!(bo.fd().is_none());
        assert!(matches!(gbm.export(&bo), Err(ImportError::Unsupported(_))));
    }

    #[test]
    fn test_wrap_native_retains() {
        let (hal, gbm) = device();
        let native = hal
            .create_native_buffer(64, 32, HAL_PIXEL_FORMAT_RGBA_8888, 0)
            .unwrap();
        let bo = gbm.wrap_native(&native).unwrap();
        assert_eq!(bo.format(), Fourcc::ABGR8888);
        hal.destroy_native_buffer(native.handle);
        assert!(hal.is_live(native.handle));

        drop(bo);
        wait_for_frees(&hal, 1);
        assert!(!hal.is_live(native.handle));
        assert!(!hal.frees()[0].was_allocated);
    }

    #[test]
    fn test_shutdown_reports_leaks() {
        let hal = Arc::new(MockHal::new());
        let config = ShimConfig {
            track_leaks: true,
            ..Default::default()
        };
        let gbm = HwcGbmDevice::new(hal.clone(), &config).unwrap();
        let kept = gbm.create_bo(8, 8, Fourcc::XRGB8888, 0).unwrap().accept();
        let dropped = gbm.create_bo(8, 8, Fourcc::XRGB8888, 0).unwrap().accept();
        drop(dropped);

        let leaked = gbm.shutdown();
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].id, kept.id());
        assert!(leaked[0].backtrace.is_some());
        assert!(kept.is_freed());
        assert_eq!(hal.live_buffers(), 0);

        drop(kept);
        assert_eq!(hal.frees().len(), 2);
        assert!(matches!(
            gbm.create_bo(8, 8, Fourcc::XRGB8888, 0),
            Err(AllocationError::DeviceClosed)
        ));
    }

    #[test]
    fn test_surface_rotation() {
        let (_hal, gbm) = device();
        let mut surface = gbm
            .create_surface(64, 64, Fourcc::XRGB8888, GBM_BO_USE_SCANOUT, 2)
            .unwrap();
        let a = surface.lock_front_buffer().unwrap();
        let b = surface.lock_front_buffer().unwrap();
        assert!(!a.same_buffer(&b));
        assert!(!surface.has_free_buffers());
        assert!(surface.lock_front_buffer().is_none());
        assert!(surface.release_buffer(&a));
        assert!(!surface.release_buffer(&a));
        let c = surface.lock_front_buffer().unwrap();
        assert!(c.same_buffer(&a));
        assert_eq!(surface.dimensions(), (64, 64));
    }

    #[test]
    fn test_rgb565_stride() {
        let (hal, gbm) = device();
        let bo = gbm.create_bo(10, 10, Fourcc::RGB565, 0).unwrap().exact().unwrap();
        assert_eq!(bo.stride(), 16 * 2);
        assert!(hal
            .calls()
            .iter()
            .any(|c| matches!(c, HalCall::Allocate(d) if d.format == HAL_PIXEL_FORMAT_RGB_565)));
    }
}
