use crate::backend::{Backend, BackendBuffer, BackendDevice, Region};
use crate::error::{AllocError, Result};
use crate::format::Usage;
use crate::handle::{BufferDesc, BufferHandle};
use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::{c_void, CString};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

/// Configuration for the memfd backend
#[derive(Debug, Clone)]
pub struct MemfdConfig {
    /// Rows are padded to a multiple of this many pixels.
    pub stride_align: u32,
    /// Name given to the memfd files (visible in /proc/<pid>/fd).
    pub name: String,
}

impl Default for MemfdConfig {
    fn default() -> Self {
        Self {
            stride_align: 16,
            name: "gralloc".to_string(),
        }
    }
}

/// Allocates buffers from anonymous shared memory.
#[derive(Debug, Clone, Default)]
pub struct MemfdBackend {
    config: MemfdConfig,
}

impl MemfdBackend {
    pub fn new(config: MemfdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MemfdConfig {
        &self.config
    }
}

fn create_memfd(name: &str) -> Result<OwnedFd> {
    let cname = CString::new(name)
        .map_err(|_| AllocError::invalid_argument(format!("memfd name {:?} contains NUL", name)))?;
    let raw = memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC)
        .map_err(|e| AllocError::backend("memfd_create", e))?;
    // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

impl Backend for MemfdBackend {
    type Device = MemfdDevice;

    fn create_device(&self) -> Result<MemfdDevice> {
        if self.config.stride_align == 0 {
            return Err(AllocError::invalid_argument("stride_align must be non-zero"));
        }
        let node = create_memfd(&format!("{}-node", self.config.name))?;
        log::debug!("memfd device created (fd {})", node.as_raw_fd());
        Ok(MemfdDevice {
            node,
            config: self.config.clone(),
        })
    }
}

/// Device context of the memfd backend.
///
/// Holds a placeholder descriptor so callers asking for the device fd get a
/// real, open file.
#[derive(Debug)]
pub struct MemfdDevice {
    node: OwnedFd,
    config: MemfdConfig,
}

impl MemfdDevice {
    /// Byte stride and total size for `desc`.
    fn layout(&self, desc: &BufferDesc) -> Result<(u32, u64)> {
        let bpp = desc.format.bytes_per_pixel();
        if bpp == 0 {
            return Err(AllocError::invalid_argument(format!(
                "unsupported format {}",
                desc.format
            )));
        }
        let align = self.config.stride_align;
        let stride = desc
            .width
            .checked_next_multiple_of(align)
            .and_then(|px| px.checked_mul(bpp))
            .ok_or_else(|| AllocError::invalid_argument("width too large"))?;
        let luma = stride as u64 * desc.height as u64;
        let (num, den) = desc.format.chroma_rows();
        Ok((stride, luma + (luma * num).div_ceil(den)))
    }
}

impl BackendDevice for MemfdDevice {
    type Buffer = MemfdBuffer;

    fn fd(&self) -> RawFd {
        self.node.as_raw_fd()
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<MemfdBuffer> {
        let (stride, size) = self.layout(desc)?;
        let fd = create_memfd(&self.config.name)?;
        let len = libc::off_t::try_from(size)
            .map_err(|_| AllocError::backend("ftruncate", Errno::EFBIG))?;
        nix::unistd::ftruncate(fd.as_raw_fd(), len)
            .map_err(|e| AllocError::backend("ftruncate", e))?;

        log::trace!(
            "memfd buffer {}x{} {} stride {} size {}",
            desc.width,
            desc.height,
            desc.format,
            stride,
            size
        );
        Ok(MemfdBuffer::new(fd, stride, size, desc.format.bytes_per_pixel()))
    }

    fn import_buffer(&self, handle: &BufferHandle) -> Result<MemfdBuffer> {
        let fd = handle
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| AllocError::backend_io("dup", &e))?;
        let stat =
            nix::sys::stat::fstat(fd.as_raw_fd()).map_err(|e| AllocError::backend("fstat", e))?;
        if (stat.st_size as u64) < handle.size() {
            log::warn!(
                "handle {} claims {} bytes but its file holds {}",
                handle.id(),
                handle.size(),
                stat.st_size
            );
            return Err(AllocError::backend("import", Errno::EINVAL));
        }
        Ok(MemfdBuffer::new(
            fd,
            handle.stride(),
            handle.size(),
            handle.format().bytes_per_pixel(),
        ))
    }
}

#[derive(Debug)]
struct Mapping {
    addr: NonNull<c_void>,
    len: usize,
}

/// A memfd-backed buffer and its CPU mapping, if any.
#[derive(Debug)]
pub struct MemfdBuffer {
    fd: OwnedFd,
    stride: u32,
    size: u64,
    bpp: u32,
    mapping: Option<Mapping>,
}

// SAFETY: the mapping pointer is only dereferenced by callers of `map`; the
// buffer itself only uses it to unmap, which is valid from any thread.
unsafe impl Send for MemfdBuffer {}

impl MemfdBuffer {
    fn new(fd: OwnedFd, stride: u32, size: u64, bpp: u32) -> Self {
        Self {
            fd,
            stride,
            size,
            bpp,
            mapping: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl BackendBuffer for MemfdBuffer {
    fn stride(&self) -> u32 {
        self.stride
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn export_fd(&self) -> Result<OwnedFd> {
        self.fd
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
        // SAFETY: mapping a file we own, at offset 0, for its full size.
        let addr = unsafe {
            mmap(
                None,
                len,
                prot,
                MapFlags::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| AllocError::backend("mmap", e))?;
        let addr = NonNull::new(addr).ok_or_else(|| AllocError::backend("mmap", Errno::EFAULT))?;
        self.mapping = Some(Mapping {
            addr,
            len: len.get(),
        });

        let offset = region.y as usize * self.stride as usize + region.x as usize * self.bpp as usize;
        // SAFETY: the region was checked against the buffer size by the caller,
        // so the offset stays inside the mapping.
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

impl Drop for MemfdBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!("dropping mapped memfd buffer: {}", e);
        }
    }
}
