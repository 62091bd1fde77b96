use crate::backend::{Backend, BackendBuffer, BackendDevice, Region};
use crate::error::{AllocError, Result};
use crate::format::{PixelFormat, Usage};
use crate::handle::{BufferDesc, BufferHandle};
use gbm::{BufferObject, BufferObjectFlags, Format};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::ptr::NonNull;

/// Environment variable overriding the render node.
pub const DEVICE_ENV: &str = "GRALLOC_GBM_DEVICE";

/// Configuration for the GBM backend
#[derive(Debug, Clone)]
pub struct GbmConfig {
    /// DRM node the device context is bound to.
    pub device_path: PathBuf,
}

impl Default for GbmConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/dri/renderD128"),
        }
    }
}

impl GbmConfig {
    /// Default configuration, with the node taken from `GRALLOC_GBM_DEVICE` when set.
    pub fn from_env() -> Self {
        match std::env::var_os(DEVICE_ENV) {
            Some(path) if !path.is_empty() => Self {
                device_path: PathBuf::from(path),
            },
            _ => Self::default(),
        }
    }
}

/// Opens GBM devices on a DRM render node.
#[derive(Debug, Clone, Default)]
pub struct GbmBackend {
    config: GbmConfig,
}

impl GbmBackend {
    pub fn new(config: GbmConfig) -> Self {
        Self { config }
    }
}

impl Backend for GbmBackend {
    type Device = GbmDevice;

    fn create_device(&self) -> Result<GbmDevice> {
        let path = &self.config.device_path;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                log::error!("failed to open {}: {}", path.display(), e);
                AllocError::Initialization
            })?;
        let device = gbm::Device::new(file).map_err(|e| {
            log::error!("failed to create gbm device on {}: {}", path.display(), e);
            AllocError::Initialization
        })?;
        log::info!("gbm device created on {}", path.display());
        Ok(GbmDevice { device })
    }
}

/// A GBM device context.
pub struct GbmDevice {
    device: gbm::Device<File>,
}

// SAFETY: libgbm devices are only touched with the module lock held.
unsafe impl Send for GbmDevice {}

/// GBM format and allocation height for a buffer.
///
/// Planar YUV is laid out as a single 8-bit plane tall enough to hold the
/// chroma rows below the luma rows.
fn gbm_layout(desc: &BufferDesc) -> Result<(Format, u32)> {
    let format = match desc.format {
        PixelFormat::RGBA_8888 => Format::Abgr8888,
        PixelFormat::RGBX_8888 => Format::Xbgr8888,
        PixelFormat::RGB_888 => Format::Bgr888,
        PixelFormat::RGB_565 => Format::Rgb565,
        PixelFormat::BGRA_8888 => Format::Argb8888,
        PixelFormat::YCBCR_422_I => Format::Yuyv,
        PixelFormat::YV12 | PixelFormat::YCBCR_422_SP | PixelFormat::YCRCB_420_SP => Format::R8,
        other => {
            return Err(AllocError::invalid_argument(format!(
                "unsupported format {}",
                other
            )));
        }
    };
    let (num, den) = desc.format.chroma_rows();
    let height = desc.height as u64 + (desc.height as u64 * num).div_ceil(den);
    let height = u32::try_from(height).map_err(|_| AllocError::invalid_argument("height too large"))?;
    Ok((format, height))
}

fn gbm_flags(usage: Usage) -> BufferObjectFlags {
    let mut flags = BufferObjectFlags::empty();
    if usage.intersects(Usage::HW_FB | Usage::HW_COMPOSER) {
        flags |= BufferObjectFlags::SCANOUT;
    }
    if usage.intersects(Usage::HW_RENDER | Usage::HW_TEXTURE | Usage::HW_2D) {
        flags |= BufferObjectFlags::RENDERING;
    }
    if usage.reads_sw() || usage.writes_sw() || usage.is_empty() {
        flags |= BufferObjectFlags::LINEAR;
    }
    flags
}

impl BackendDevice for GbmDevice {
    type Buffer = GbmBuffer;

    fn fd(&self) -> RawFd {
        self.device.as_fd().as_raw_fd()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GbmBuffer> {
        let (format, height) = gbm_layout(desc)?;
        let bo = self
            .device
            .create_buffer_object::<()>(desc.width, height, format, gbm_flags(desc.usage))
            .map_err(|e| AllocError::backend_io("gbm_bo_create", &e))?;
        GbmBuffer::new(bo, height, desc.format.bytes_per_pixel())
    }

    fn import_buffer(&self, handle: &BufferHandle) -> Result<GbmBuffer> {
        let (format, height) = gbm_layout(handle.desc())?;
        let bo = self
            .device
            .import_buffer_object_from_dma_buf::<()>(
                handle.as_fd(),
                handle.width(),
                height,
                handle.stride(),
                format,
                gbm_flags(handle.usage()),
            )
            .map_err(|e| AllocError::backend_io("gbm_bo_import", &e))?;
        GbmBuffer::new(bo, height, handle.format().bytes_per_pixel())
    }
}

struct Mapping {
    addr: NonNull<c_void>,
    len: usize,
}

/// A GBM buffer object with its exported dma-buf.
pub struct GbmBuffer {
    bo: BufferObject<()>,
    dmabuf: OwnedFd,
    size: u64,
    bpp: u32,
    mapping: Option<Mapping>,
}

// SAFETY: see GbmDevice; the mapping is only unmapped, never read, by this type.
unsafe impl Send for GbmBuffer {}

impl GbmBuffer {
    fn new(bo: BufferObject<()>, height: u32, bpp: u32) -> Result<Self> {
        let dmabuf = bo
            .fd()
            .map_err(|_| AllocError::backend("gbm_bo_get_fd", Errno::EBADF))?;
        let size = bo.stride() as u64 * height as u64;
        Ok(Self {
            bo,
            dmabuf,
            size,
            bpp,
            mapping: None,
        })
    }
}

impl BackendBuffer for GbmBuffer {
    fn stride(&self) -> u32 {
        self.bo.stride()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn export_fd(&self) -> Result<OwnedFd> {
        self.dmabuf
            .try_clone()
            .map_err(|e| AllocError::backend_io("export", &e))
    }

    fn map(&mut self, usage: Usage, region: Region) -> Result<NonNull<u8>> {
        if self.mapping.is_some() {
            return Err(AllocError::backend("map", Errno::EBUSY));
        }
        let len = usize::try_from(self.size)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| AllocError::backend("map", Errno::EINVAL))?;
        let mut prot = ProtFlags::PROT_READ;
        if usage.writes_sw() || !usage.reads_sw() {
            prot |= ProtFlags::PROT_WRITE;
        }
        // SAFETY: mapping the dma-buf we exported, at offset 0, for its full size.
        let addr = unsafe {
            mmap(
                None,
                len,
                prot,
                MapFlags::MAP_SHARED,
                self.dmabuf.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| AllocError::backend("mmap", e))?;
        let addr = NonNull::new(addr).ok_or_else(|| AllocError::backend("mmap", Errno::EFAULT))?;
        self.mapping = Some(Mapping {
            addr,
            len: len.get(),
        });
        let offset =
            region.y as usize * self.bo.stride() as usize + region.x as usize * self.bpp as usize;
        // SAFETY: the caller checked the region against the buffer geometry.
        Ok(unsafe { addr.cast::<u8>().add(offset) })
    }

    fn unmap(&mut self) -> Result<()> {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: addr/len come from the mmap call in `map`.
            unsafe { munmap(mapping.addr.as_ptr(), mapping.len) }
                .map_err(|e| AllocError::backend("munmap", e))?;
        }
        Ok(())
    }
}

impl Drop for GbmBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!("dropping mapped gbm buffer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(format: PixelFormat, usage: Usage) -> BufferDesc {
        BufferDesc {
            width: 64,
            height: 64,
            format,
            usage,
        }
    }

    #[test]
    fn planar_formats_are_tall_r8() {
        let (format, height) = gbm_layout(&desc(PixelFormat::YV12, Usage::empty())).unwrap();
        assert_eq!(format, Format::R8);
        assert_eq!(height, 96);
        let (_, height) = gbm_layout(&desc(PixelFormat::YCBCR_422_SP, Usage::empty())).unwrap();
        assert_eq!(height, 128);
    }

    #[test]
    fn usage_maps_to_flags() {
        let flags = gbm_flags(Usage::HW_FB | Usage::HW_RENDER);
        assert!(flags.contains(BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING));
        assert!(!flags.contains(BufferObjectFlags::LINEAR));
        assert!(gbm_flags(Usage::SW_WRITE_OFTEN).contains(BufferObjectFlags::LINEAR));
    }

    #[test]
    fn missing_node_fails_initialization() {
        let backend = GbmBackend::new(GbmConfig {
            device_path: PathBuf::from("/nonexistent/renderD999"),
        });
        assert!(matches!(backend.create_device(), Err(AllocError::Initialization)));
    }
}
