use crate::backend::{Backend, BackendBuffer, BackendDevice};
use crate::context::DeviceContext;
use crate::error::{AllocError, Result};
use crate::format::{PixelFormat, Usage};
use crate::handle::{BufferDesc, BufferHandle, BufferId};
use crate::registry::{BufferObject, Origin};
use std::sync::Arc;

/// Allocation device handed to one client by `GrallocModule::open`.
///
/// Closing (or dropping) the device destroys the shared device context.
/// Outstanding allocations are not tracked; the client frees them first.
pub struct AllocationDevice<B: Backend> {
    context: Arc<DeviceContext<B>>,
    closed: bool,
}

impl<B: Backend> AllocationDevice<B> {
    pub(crate) fn open(context: Arc<DeviceContext<B>>) -> Result<Self> {
        context.ensure_initialized()?;
        Ok(AllocationDevice {
            context,
            closed: false,
        })
    }

    /// Allocates a buffer and returns its handle and its stride in pixels.
    pub fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<(BufferHandle, u32)> {
        if width == 0 || height == 0 {
            return Err(AllocError::invalid_argument(format!(
                "empty buffer {}x{}",
                width, height
            )));
        }
        let bpp = format.bytes_per_pixel();
        if bpp == 0 {
            return Err(AllocError::invalid_argument(format!(
                "unsupported format {}",
                format
            )));
        }
        let desc = BufferDesc {
            width,
            height,
            format,
            usage,
        };

        let mut state = self.context.lock();
        let buffer = state
            .device_or_init(self.context.backend())?
            .create_buffer(&desc)?;

        // From here on `buffer` is dropped, and so released, on every error return.
        let stride = buffer.stride();
        if stride % bpp != 0 {
            return Err(AllocError::invalid_argument(format!(
                "stride {} is not a whole number of {} byte pixels",
                stride, bpp
            )));
        }
        let fd = buffer.export_fd()?;
        let id = BufferId::new_unique();
        let handle = BufferHandle::new(id, fd, desc, stride, buffer.size());

        let object = BufferObject::allocated(desc, stride, buffer);
        let pixel_stride = object.pixel_stride();
        state.registry.insert(id, object);

        log::debug!(
            "buffer {} {}x{} {} usage = {:08x} stride = {}",
            id,
            width,
            height,
            format,
            usage.bits(),
            pixel_stride
        );
        Ok((handle, pixel_stride))
    }

    /// Releases a buffer allocated through this module and closes its handle.
    ///
    /// Handles this module only imported are rejected as invalid.
    pub fn free(&self, handle: BufferHandle) -> Result<()> {
        let mut state = self.context.lock();
        match state.registry.get(handle.id()) {
            Some(object) if object.origin == Origin::Allocated => {}
            Some(_) => {
                log::warn!("buffer {} was not allocated here", handle.id());
                return Err(AllocError::InvalidHandle);
            }
            None => return Err(AllocError::InvalidHandle),
        }
        state.registry.remove(handle.id());
        log::debug!("buffer {} freed", handle.id());
        Ok(())
    }

    /// Destroys the device context and releases this device.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.context.destroy() {
            log::debug!("device context already destroyed");
        }
    }
}

impl<B: Backend> Drop for AllocationDevice<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfd::MemfdBackend;

    fn open() -> AllocationDevice<MemfdBackend> {
        AllocationDevice::open(Arc::new(DeviceContext::new(MemfdBackend::default()))).unwrap()
    }

    #[test]
    fn rejects_bad_arguments() {
        let device = open();
        for (w, h, format) in [
            (0, 16, PixelFormat::RGBA_8888),
            (16, 0, PixelFormat::RGBA_8888),
            (16, 16, PixelFormat(0)),
        ] {
            assert!(matches!(
                device.allocate(w, h, format, Usage::empty()),
                Err(AllocError::InvalidArgument(_))
            ));
        }
        assert_eq!(device.context.buffer_count(), 0);
    }

    #[test]
    fn free_consumes_state() {
        let device = open();
        let (handle, stride) = device
            .allocate(20, 4, PixelFormat::RGB_565, Usage::SW_WRITE_OFTEN)
            .unwrap();
        assert_eq!(stride, 32);
        assert_eq!(handle.stride(), 64);
        assert_eq!(device.context.buffer_count(), 1);
        device.free(handle).unwrap();
        assert_eq!(device.context.buffer_count(), 0);
    }

    #[test]
    fn close_destroys_context() {
        let context = Arc::new(DeviceContext::new(MemfdBackend::default()));
        let device = AllocationDevice::open(context.clone()).unwrap();
        assert!(context.is_initialized());
        device.close();
        assert!(!context.is_initialized());
    }
}
