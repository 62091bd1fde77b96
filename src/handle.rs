//! The transferable buffer handle.
//!
//! A handle carries the shareable memory descriptor and enough metadata for
//! another module instance to import it. It never carries addresses; the
//! state it resolves to lives in the registry of whichever module
//! registered or allocated it.

use crate::error::{AllocError, Result};
use crate::format::{PixelFormat, Usage};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one allocation.
///
/// Combines the allocating process id with a serial that is never reused, so
/// a handle outliving its buffer can never resolve to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub origin: u32,
    pub serial: u64,
}

impl BufferId {
    pub(crate) fn new_unique() -> Self {
        static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
        BufferId {
            origin: std::process::id(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.origin, self.serial)
    }
}

/// Geometry of a buffer as requested by `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: Usage,
}

/// Opaque cross-process buffer handle.
#[derive(Debug)]
pub struct BufferHandle {
    id: BufferId,
    fd: OwnedFd,
    desc: BufferDesc,
    /// Row stride in bytes.
    stride: u32,
    /// Size of the backing memory in bytes.
    size: u64,
}

impl BufferHandle {
    pub(crate) fn new(id: BufferId, fd: OwnedFd, desc: BufferDesc, stride: u32, size: u64) -> Self {
        BufferHandle {
            id,
            fd,
            desc,
            stride,
            size,
        }
    }

    /// Rebuilds a handle received from another process.
    ///
    /// Fails with `InvalidHandle` when the metadata cannot describe a buffer.
    pub fn from_parts(
        id: BufferId,
        fd: OwnedFd,
        desc: BufferDesc,
        stride: u32,
        size: u64,
    ) -> Result<Self> {
        let bpp = desc.format.bytes_per_pixel() as u64;
        if desc.width == 0 || desc.height == 0 || bpp == 0 {
            return Err(AllocError::InvalidHandle);
        }
        if (stride as u64) < desc.width as u64 * bpp || size < stride as u64 * desc.height as u64 {
            return Err(AllocError::InvalidHandle);
        }
        Ok(Self::new(id, fd, desc, stride, size))
    }

    /// Duplicates the handle, including its descriptor.
    ///
    /// This is how a handle is prepared for transfer to another consumer.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|e| AllocError::backend_io("dup handle", &e))?;
        Ok(Self { fd, ..*self })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    pub fn usage(&self) -> Usage {
        self.desc.usage
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for BufferHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Region;
    use crate::memfd::MemfdBackend;
    use crate::module::GrallocModule;

    fn dup(handle: &BufferHandle) -> OwnedFd {
        handle.as_fd().try_clone_to_owned().unwrap()
    }

    #[test]
    fn from_parts_rejects_inconsistent_metadata() {
        let module = GrallocModule::new(MemfdBackend::default());
        let device = module.open("gpu0").unwrap();
        let (handle, _) = device
            .allocate(16, 4, PixelFormat::RGBA_8888, Usage::SW_WRITE_OFTEN)
            .unwrap();
        let desc = *handle.desc();
        let (stride, size) = (handle.stride(), handle.size());

        let cases = [
            (BufferDesc { width: 0, ..desc }, stride, size),
            (BufferDesc { height: 0, ..desc }, stride, size),
            (BufferDesc { format: PixelFormat(0x999), ..desc }, stride, size),
            (desc, 16 * 4 - 1, size),
            (desc, stride, stride as u64 * 4 - 1),
        ];
        for (desc, stride, size) in cases {
            assert!(matches!(
                BufferHandle::from_parts(handle.id(), dup(&handle), desc, stride, size),
                Err(AllocError::InvalidHandle)
            ));
        }
        device.free(handle).unwrap();
    }

    #[test]
    fn rebuilt_handle_imports_and_maps() {
        let backend = MemfdBackend::default();
        let owner = GrallocModule::new(backend.clone());
        let consumer = GrallocModule::new(backend);
        let device = owner.open("gpu0").unwrap();
        let usage = Usage::SW_READ_OFTEN | Usage::SW_WRITE_OFTEN;
        let (handle, _) = device
            .allocate(16, 4, PixelFormat::RGBA_8888, usage)
            .unwrap();

        let ptr = owner
            .lock(&handle, Usage::SW_WRITE_OFTEN, Region::full(16, 4))
            .unwrap();
        // SAFETY: the mapping spans at least one 64 byte row.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5a, 64) };
        owner.unlock(&handle).unwrap();

        let rebuilt = BufferHandle::from_parts(
            handle.id(),
            dup(&handle),
            *handle.desc(),
            handle.stride(),
            handle.size(),
        )
        .unwrap();
        consumer.register_buffer(&rebuilt).unwrap();
        let ptr = consumer
            .lock(&rebuilt, Usage::SW_READ_OFTEN, Region::full(16, 4))
            .unwrap();
        // SAFETY: as above, in the consumer's mapping.
        let row = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(row.iter().all(|&b| b == 0x5a));
        consumer.unlock(&rebuilt).unwrap();
        consumer.unregister_buffer(&rebuilt).unwrap();
        assert_eq!(consumer.context().buffer_count(), 0);
        device.free(handle).unwrap();
    }
}
