//! EGL integration for hwcomposer buffers
//!
//! Buffer objects are handed to GL as images created from their dma-buf
//! (`EGL_LINUX_DMA_BUF_EXT` with the plane 0 fd, offset and pitch), and
//! buffers rendered on the HAL side come back as buffer objects. The
//! client-composition fallback draws through the same bridge.

use crate::error::ImportError;
use crate::format::{Fourcc, DRM_FORMAT_MOD_INVALID, DRM_FORMAT_MOD_LINEAR};
use crate::gbm_device::{BufferObject, HwcGbmDevice, NativeBuffer};
use crate::hal::FloatRect;
use crate::model::Rect;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

pub type GlImageId = u64;

#[derive(Error, Debug)]
pub enum GlError {
    #[error("unknown image {0}")]
    UnknownImage(GlImageId),

    #[error("cannot access image memory: {0}")]
    Map(#[source] io::Error),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("image {image} is too small for {width}x{height} with pitch {pitch}")]
    OutOfBounds {
        image: GlImageId,
        width: u32,
        height: u32,
        pitch: u32,
    },

    #[error("GL backend error: {0}")]
    Backend(String),
}

/// `EGL_DMA_BUF_PLANE0_*` attributes of a single-plane image
#[derive(Debug, Clone, Copy)]
pub struct DmaBufAttributes<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub offset: u32,
    pub pitch: u32,
    pub modifier: u64,
}

/// One textured quad of a blit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitLayer {
    pub image: GlImageId,
    pub src: FloatRect,
    pub dst: Rect,
    /// Blend with premultiplied alpha instead of overwriting
    pub blend: bool,
}

/// The GL side of buffer sharing. A real implementation wraps
/// `eglCreateImageKHR` and a GLES blit program.
pub trait GlBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, format: Fourcc, modifier: u64) -> bool;

    fn create_image(&self, attrs: &DmaBufAttributes<'_>) -> Result<GlImageId, GlError>;

    fn destroy_image(&self, image: GlImageId);

    /// Clear `target` to transparent black, then draw `layers` bottom to top
    fn blit(&self, target: GlImageId, layers: &[BlitLayer]) -> Result<(), GlError>;
}

/// A buffer object bound as a GL image. Keeps the buffer alive.
pub struct EglImage {
    id: GlImageId,
    bo: BufferObject,
    backend: Arc<dyn GlBackend>,
}

impl EglImage {
    pub fn id(&self) -> GlImageId {
        self.id
    }

    pub fn buffer(&self) -> &BufferObject {
        &self.bo
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.bo.width(), self.bo.height())
    }
}

impl Drop for EglImage {
    fn drop(&mut self) {
        debug!("Destroying GL image {}", self.id);
        self.backend.destroy_image(self.id);
    }
}

/// Moves buffers between the GBM allocator and GL
#[derive(Clone)]
pub struct EglBridge {
    backend: Arc<dyn GlBackend>,
    gbm: HwcGbmDevice,
}

impl EglBridge {
    pub fn new(backend: Arc<dyn GlBackend>, gbm: HwcGbmDevice) -> Self {
        Self { backend, gbm }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Bind a buffer object as a GL image
    pub fn import_for_gl(&self, bo: &BufferObject) -> Result<EglImage, ImportError> {
        if bo.is_protected() {
            return Err(ImportError::Unsupported(
                "protected buffers cannot be sampled by GL".to_string(),
            ));
        }
        if !self.backend.supports(bo.format(), bo.modifier()) {
            return Err(ImportError::UnsupportedFormat {
                format: bo.format(),
                modifier: bo.modifier(),
            });
        }
        let fd = bo.fd().ok_or_else(|| {
            ImportError::Unsupported(format!("buffer {} has no dma-buf", bo.id()))
        })?;
        let attrs = DmaBufAttributes {
            fd,
            width: bo.width(),
            height: bo.height(),
            format: bo.format(),
            offset: bo.offset(),
            pitch: bo.stride(),
            modifier: bo.modifier(),
        };
        let id = self
            .backend
            .create_image(&attrs)
            .map_err(|e| ImportError::Unsupported(e.to_string()))?;
        debug!(
            "Buffer {} bound as GL image {} ({}x{} {:?})",
            bo.id(),
            id,
            bo.width(),
            bo.height(),
            bo.format()
        );
        Ok(EglImage {
            id,
            bo: bo.retain(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Wrap a buffer the HAL rendered into as a buffer object
    pub fn export_from_gl(&self, native: &NativeBuffer) -> Result<BufferObject, ImportError> {
        self.gbm.wrap_native(native)
    }

    /// Draw `layers` into `target`. Each layer is `(buffer, source crop,
    /// destination)` in target coordinates, bottom first.
    pub(crate) fn compose(
        &self,
        target: &BufferObject,
        layers: &[(&BufferObject, FloatRect, Rect)],
    ) -> Result<(), GlError> {
        let target = self.import_for_gl(target)?;
        let images = layers
            .iter()
            .map(|(bo, _, _)| self.import_for_gl(bo))
            .collect::<Result<Vec<_>, _>>()?;
        let quads: Vec<BlitLayer> = images
            .iter()
            .zip(layers)
            .map(|(image, (bo, src, dst))| BlitLayer {
                image: image.id(),
                src: *src,
                dst: *dst,
                blend: bo.format().has_alpha(),
            })
            .collect();
        self.backend.blit(target.id(), &quads)
    }
}

struct CpuImage {
    file: File,
    width: u32,
    height: u32,
    format: Fourcc,
    offset: u32,
    pitch: u32,
}

impl CpuImage {
    fn read(&self) -> Result<Vec<u8>, GlError> {
        let mut data = vec![0u8; self.pitch as usize * self.height as usize];
        self.file
            .read_exact_at(&mut data, u64::from(self.offset))
            .map_err(GlError::Map)?;
        Ok(data)
    }

    fn write(&self, data: &[u8]) -> Result<(), GlError> {
        self.file
            .write_all_at(data, u64::from(self.offset))
            .map_err(GlError::Map)
    }

    fn bpp(&self) -> usize {
        self.format.bytes_per_pixel().unwrap_or(4) as usize
    }

    fn out_of_bounds(&self, image: GlImageId) -> GlError {
        GlError::OutOfBounds {
            image,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }
}

/// Unpack one pixel to premultiplied RGBA
fn load_pixel(format: Fourcc, px: &[u8]) -> [u8; 4] {
    match format {
        Fourcc::ARGB8888 => [px[2], px[1], px[0], px[3]],
        Fourcc::XRGB8888 => [px[2], px[1], px[0], 0xff],
        Fourcc::ABGR8888 => [px[0], px[1], px[2], px[3]],
        Fourcc::XBGR8888 => [px[0], px[1], px[2], 0xff],
        Fourcc::RGB565 => {
            let v = u16::from_le_bytes([px[0], px[1]]);
            let r = ((v >> 11) & 0x1f) as u8;
            let g = ((v >> 5) & 0x3f) as u8;
            let b = (v & 0x1f) as u8;
            [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2), 0xff]
        }
        _ => [0, 0, 0, 0],
    }
}

fn store_pixel(format: Fourcc, [r, g, b, a]: [u8; 4], px: &mut [u8]) {
    match format {
        Fourcc::ARGB8888 => px.copy_from_slice(&[b, g, r, a]),
        Fourcc::XRGB8888 => px.copy_from_slice(&[b, g, r, 0xff]),
        Fourcc::ABGR8888 => px.copy_from_slice(&[r, g, b, a]),
        Fourcc::XBGR8888 => px.copy_from_slice(&[r, g, b, 0xff]),
        Fourcc::RGB565 => {
            let v = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
            px.copy_from_slice(&v.to_le_bytes());
        }
        _ => {}
    }
}

/// Premultiplied source-over
fn blend_over(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let inv = 255 - u32::from(src[3]);
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = (u32::from(src[i]) + (u32::from(dst[i]) * inv + 127) / 255).min(255) as u8;
    }
    out
}

/// Software GL stand-in: reads and writes images through their dma-buf fds
/// and blits with nearest-neighbour sampling. Used by the mock HAL and by
/// hosts without a usable GLES driver.
#[derive(Default)]
pub struct CpuGlBackend {
    images: Mutex<HashMap<GlImageId, CpuImage>>,
    next_id: AtomicU64,
}

impl CpuGlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_images(&self) -> usize {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl GlBackend for CpuGlBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supports(&self, format: Fourcc, modifier: u64) -> bool {
        format.is_known() && (modifier == DRM_FORMAT_MOD_LINEAR || modifier == DRM_FORMAT_MOD_INVALID)
    }

    fn create_image(&self, attrs: &DmaBufAttributes<'_>) -> Result<GlImageId, GlError> {
        let fd = attrs.fd.try_clone_to_owned().map_err(GlError::Map)?;
        let image = CpuImage {
            file: File::from(fd),
            width: attrs.width,
            height: attrs.height,
            format: attrs.format,
            offset: attrs.offset,
            pitch: attrs.pitch,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, image);
        Ok(id)
    }

    fn destroy_image(&self, image: GlImageId) {
        let removed = self
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&image);
        if removed.is_none() {
            warn!("Destroying unknown GL image {}", image);
        }
    }

    fn blit(&self, target: GlImageId, layers: &[BlitLayer]) -> Result<(), GlError> {
        let images = self.images.lock().unwrap_or_else(PoisonError::into_inner);
        let dst_image = images.get(&target).ok_or(GlError::UnknownImage(target))?;
        let dst_bpp = dst_image.bpp();
        let pitch = dst_image.pitch as usize;
        let mut out = vec![0u8; pitch * dst_image.height as usize];

        for layer in layers {
            let src_image = images
                .get(&layer.image)
                .ok_or(GlError::UnknownImage(layer.image))?;
            let src = src_image.read()?;
            let src_bpp = src_image.bpp();
            let dst = layer.dst;
            if dst.is_empty() {
                continue;
            }
            let scale_x = layer.src.width() / dst.width as f32;
            let scale_y = layer.src.height() / dst.height as f32;

            let x0 = dst.x.max(0);
            let y0 = dst.y.max(0);
            let x1 = (i64::from(dst.x) + i64::from(dst.width)).min(i64::from(dst_image.width)) as i32;
            let y1 = (i64::from(dst.y) + i64::from(dst.height)).min(i64::from(dst_image.height)) as i32;
            for ty in y0..y1 {
                let sy = layer.src.top + ((ty - dst.y) as f32 + 0.5) * scale_y;
                let sy = (sy as u32).min(src_image.height.saturating_sub(1)) as usize;
                for tx in x0..x1 {
                    let sx = layer.src.left + ((tx - dst.x) as f32 + 0.5) * scale_x;
                    let sx = (sx as u32).min(src_image.width.saturating_sub(1)) as usize;
                    let at = sy * src_image.pitch as usize + sx * src_bpp;
                    let px = src
                        .get(at..at + src_bpp)
                        .ok_or_else(|| src_image.out_of_bounds(layer.image))?;
                    let pixel = load_pixel(src_image.format, px);

                    let to = ty as usize * pitch + tx as usize * dst_bpp;
                    let slot = out
                        .get_mut(to..to + dst_bpp)
                        .ok_or_else(|| dst_image.out_of_bounds(target))?;
                    let value = if layer.blend {
                        blend_over(pixel, load_pixel(dst_image.format, slot))
                    } else {
                        pixel
                    };
                    store_pixel(dst_image.format, value, slot);
                }
            }
        }
        dst_image.write(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShimConfig;
    use crate::gbm_device::gbm_usage::GBM_BO_USE_PROTECTED;
    use crate::hal::mock::MockHal;
    use crate::hal::{GRALLOC_USAGE_HW_RENDER, HAL_PIXEL_FORMAT_RGBA_8888};

    fn bridge() -> (Arc<MockHal>, Arc<CpuGlBackend>, EglBridge) {
        let hal = Arc::new(MockHal::new());
        let gbm = HwcGbmDevice::new(hal.clone(), &ShimConfig::default()).unwrap();
        let backend = Arc::new(CpuGlBackend::new());
        let bridge = EglBridge::new(backend.clone(), gbm);
        (hal, backend, bridge)
    }

    fn fill(bo: &BufferObject, rgba: [u8; 4]) {
        let file = File::from(bo.fd().unwrap().try_clone_to_owned().unwrap());
        let bpp = bo.format().bytes_per_pixel().unwrap() as usize;
        let mut px = vec![0u8; bpp];
        store_pixel(bo.format(), rgba, &mut px);
        let row: Vec<u8> = px.repeat(bo.stride() as usize / bpp);
        for y in 0..bo.height() {
            file.write_all_at(&row, u64::from(y * bo.stride())).unwrap();
        }
    }

    fn pixel_at(bo: &BufferObject, x: u32, y: u32) -> [u8; 4] {
        let file = File::from(bo.fd().unwrap().try_clone_to_owned().unwrap());
        let bpp = bo.format().bytes_per_pixel().unwrap();
        let mut px = vec![0u8; bpp as usize];
        file.read_exact_at(&mut px, u64::from(y * bo.stride() + x * bpp))
            .unwrap();
        load_pixel(bo.format(), &px)
    }

    #[test]
    fn test_pixel_packing() {
        let mut px = [0u8; 4];
        store_pixel(Fourcc::ARGB8888, [1, 2, 3, 4], &mut px);
        assert_eq!(px, [3, 2, 1, 4]);
        assert_eq!(load_pixel(Fourcc::ARGB8888, &px), [1, 2, 3, 4]);
        assert_eq!(load_pixel(Fourcc::XBGR8888, &[9, 8, 7, 0]), [9, 8, 7, 0xff]);

        let mut short = [0u8; 2];
        store_pixel(Fourcc::RGB565, [0xff, 0, 0xff, 0xff], &mut short);
        assert_eq!(load_pixel(Fourcc::RGB565, &short), [0xff, 0, 0xff, 0xff]);
    }

    #[test]
    fn test_blend_over() {
        assert_eq!(blend_over([0, 0, 0, 0], [10, 20, 30, 255]), [10, 20, 30, 255]);
        assert_eq!(blend_over([200, 0, 0, 255], [10, 20, 30, 255]), [200, 0, 0, 255]);
        assert_eq!(blend_over([64, 0, 0, 128], [0, 0, 200, 255]), [64, 0, 100, 255]);
    }

    #[test]
    fn test_compose_flattens_layers() {
        let (_hal, backend, bridge) = bridge();
        let gbm = &bridge.gbm;
        let target = gbm.create_bo(32, 32, Fourcc::ARGB8888, 0).unwrap().accept();
        let bottom = gbm.create_bo(32, 32, Fourcc::XRGB8888, 0).unwrap().accept();
        let top = gbm.create_bo(8, 8, Fourcc::ABGR8888, 0).unwrap().accept();
        fill(&bottom, [0, 0, 255, 255]);
        fill(&top, [255, 0, 0, 255]);

        let full = FloatRect {
            left: 0.0,
            top: 0.0,
            right: 32.0,
            bottom: 32.0,
        };
        let small = FloatRect {
            left: 0.0,
            top: 0.0,
            right: 8.0,
            bottom: 8.0,
        };
        bridge
            .compose(
                &target,
                &[
                    (&bottom, full, Rect::new(0, 0, 32, 32)),
                    (&top, small, Rect::new(16, 16, 16, 16)),
                ],
            )
            .unwrap();

        assert_eq!(pixel_at(&target, 0, 0), [0, 0, 255, 255]);
        assert_eq!(pixel_at(&target, 20, 20), [255, 0, 0, 255]);
        assert_eq!(pixel_at(&target, 31, 31), [255, 0, 0, 255]);
        assert_eq!(backend.live_images(), 0);
    }

    #[test]
    fn test_offscreen_layers_are_clipped() {
        let (_hal, _backend, bridge) = bridge();
        let gbm = &bridge.gbm;
        let target = gbm.create_bo(16, 16, Fourcc::ARGB8888, 0).unwrap().accept();
        let layer = gbm.create_bo(16, 16, Fourcc::XRGB8888, 0).unwrap().accept();
        fill(&layer, [0, 255, 0, 255]);
        let crop = FloatRect {
            left: 0.0,
            top: 0.0,
            right: 16.0,
            bottom: 16.0,
        };
        bridge
            .compose(&target, &[(&layer, crop, Rect::new(-8, 8, 16, 16))])
            .unwrap();
        assert_eq!(pixel_at(&target, 0, 0), [0, 0, 0, 0]);
        assert_eq!(pixel_at(&target, 7, 15), [0, 255, 0, 255]);
        assert_eq!(pixel_at(&target, 8, 15), [0, 0, 0, 0]);
    }

    #[test]
    fn test_import_rejections() {
        let (_hal, _backend, bridge) = bridge();
        let protected = bridge
            .gbm
            .create_bo(16, 16, Fourcc::ARGB8888, GBM_BO_USE_PROTECTED)
            .unwrap()
            .accept();
        assert!(matches!(
            bridge.import_for_gl(&protected),
            Err(ImportError::Unsupported(_))
        ));

        let backend = CpuGlBackend::new();
        assert!(!backend.supports(Fourcc::ARGB8888, 0x0100_0000_0000_0001));
        assert!(!backend.supports(Fourcc(0x1234_5678), DRM_FORMAT_MOD_LINEAR));
    }

    #[test]
    fn test_blit_with_short_pitch_fails_cleanly() {
        let (_hal, backend, bridge) = bridge();
        let source = bridge
            .gbm
            .create_bo(64, 64, Fourcc::ARGB8888, 0)
            .unwrap()
            .accept();
        let target = bridge
            .gbm
            .create_bo(64, 64, Fourcc::ARGB8888, 0)
            .unwrap()
            .accept();
        fn attrs(bo: &BufferObject, pitch: u32) -> DmaBufAttributes<'_> {
            DmaBufAttributes {
                fd: bo.fd().unwrap(),
                width: 64,
                height: 64,
                format: Fourcc::ARGB8888,
                offset: 0,
                pitch,
                modifier: DRM_FORMAT_MOD_LINEAR,
            }
        }
        let narrow = backend.create_image(&attrs(&source, 16)).unwrap();
        let out = backend.create_image(&attrs(&target, target.stride())).unwrap();

        let layer = BlitLayer {
            image: narrow,
            src: FloatRect {
                left: 0.0,
                top: 0.0,
                right: 64.0,
                bottom: 64.0,
            },
            dst: Rect::new(0, 0, 64, 64),
            blend: false,
        };
        assert!(matches!(
            backend.blit(out, &[layer]),
            Err(GlError::OutOfBounds { image, pitch: 16, .. }) if image == narrow
        ));
        backend.destroy_image(narrow);
        backend.destroy_image(out);
    }

    #[test]
    fn test_export_from_gl() {
        let (hal, backend, bridge) = bridge();
        let native = hal
            .create_native_buffer(64, 32, HAL_PIXEL_FORMAT_RGBA_8888, GRALLOC_USAGE_HW_RENDER)
            .unwrap();
        let bo = bridge.export_from_gl(&native).unwrap();
        assert_eq!(bo.format(), Fourcc::ABGR8888);
        assert_eq!((bo.width(), bo.height()), (64, 32));

        let image = bridge.import_for_gl(&bo).unwrap();
        assert_eq!(image.dimensions(), (64, 32));
        assert_eq!(backend.live_images(), 1);
        drop(image);
        assert_eq!(backend.live_images(), 0);
    }
}
