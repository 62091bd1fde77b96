use crate::error::Result;
use crate::format::Usage;
use crate::handle::{BufferDesc, BufferHandle};
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// Rectangle of a buffer, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Region { x, y, width, height }
    }

    /// The whole `width` x `height` surface.
    pub fn full(width: u32, height: u32) -> Self {
        Region::new(0, 0, width, height)
    }

    /// Whether the region is non-empty and lies inside a `width` x `height` surface.
    pub(crate) fn fits(&self, width: u32, height: u32) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        right <= width as u64 && bottom <= height as u64
    }
}

/// Buffer-management facility the allocator sits on.
///
/// Creating a device is the only entry point; everything else hangs off the
/// device and the buffers it creates.
pub trait Backend: Send + Sync {
    type Device: BackendDevice;

    fn create_device(&self) -> Result<Self::Device>;
}

/// A live device context bound to a hardware node.
pub trait BackendDevice: Send {
    type Buffer: BackendBuffer;

    /// Descriptor of the node this device is bound to.
    fn fd(&self) -> RawFd;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Attaches local state to a buffer allocated elsewhere.
    fn import_buffer(&self, handle: &BufferHandle) -> Result<Self::Buffer>;
}

/// One buffer object. Dropping it releases the backend resources.
pub trait BackendBuffer: Send {
    /// Row stride in bytes.
    fn stride(&self) -> u32;

    /// Size of the backing memory in bytes.
    fn size(&self) -> u64;

    /// Exports a shareable descriptor for the buffer.
    fn export_fd(&self) -> Result<OwnedFd>;

    /// Maps `region` for CPU access and returns the address of its first pixel.
    ///
    /// Mapping an already mapped buffer is rejected by the backend.
    fn map(&mut self, usage: Usage, region: Region) -> Result<NonNull<u8>>;

    /// Releases the CPU mapping. Unmapping an unmapped buffer is a no-op.
    fn unmap(&mut self) -> Result<()>;
}

impl<T> Backend for Arc<T>
where
    T: Backend + ?Sized,
{
    type Device = T::Device;

    fn create_device(&self) -> Result<Self::Device> {
        (**self).create_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_bounds() {
        assert!(Region::full(8, 8).fits(8, 8));
        assert!(Region::new(7, 7, 1, 1).fits(8, 8));
        assert!(!Region::new(4, 4, 5, 1).fits(8, 8));
        assert!(!Region::new(u32::MAX, 0, 2, 1).fits(8, 8));
        assert!(!Region::new(8, 8, 0, 0).fits(8, 8));
        assert!(!Region::new(0, 0, 0, 4).fits(8, 8));
        assert!(!Region::new(0, 0, 4, 0).fits(8, 8));
    }
}
