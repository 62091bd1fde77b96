//! Module-level operations.
//!
//! These are callable by any holder of a valid handle, whether or not it
//! opened an allocation device. A handle allocated by another module
//! instance (standing in for another process) must be registered before it
//! can be locked.

use crate::alloc_device::AllocationDevice;
use crate::backend::{Backend, BackendBuffer, BackendDevice, Region};
use crate::context::DeviceContext;
use crate::error::{AllocError, Result};
use crate::format::Usage;
use crate::handle::BufferHandle;
use crate::registry::{BufferObject, Origin};
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// Descriptor the host runtime reads when it loads the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub author: &'static str,
    pub version_major: u16,
    pub version_minor: u16,
}

pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    id: "gralloc",
    name: "GBM Memory Allocator",
    author: "Rob Herring - Linaro",
    version_major: 1,
    version_minor: 0,
};

/// The only device name `open` accepts.
pub const GPU0: &str = "gpu0";

/// Requests understood by `perform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformRequest {
    /// Descriptor of the node the device context is bound to.
    GetDeviceFd,
    /// Computed usage for a buffer. Not implemented: always answers `Done`.
    GetUsage,
}

impl PerformRequest {
    pub const GET_DRM_FD: u32 = 0x8000_0002;
    pub const GET_USAGE: u32 = 0xffee_ff03;

    pub fn code(self) -> u32 {
        match self {
            PerformRequest::GetDeviceFd => Self::GET_DRM_FD,
            PerformRequest::GetUsage => Self::GET_USAGE,
        }
    }
}

impl TryFrom<u32> for PerformRequest {
    type Error = AllocError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            Self::GET_DRM_FD => Ok(PerformRequest::GetDeviceFd),
            Self::GET_USAGE => Ok(PerformRequest::GetUsage),
            other => Err(AllocError::invalid_argument(format!(
                "unsupported perform operation {:#x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformResponse {
    DeviceFd(RawFd),
    /// The operation succeeded without producing a value.
    Done,
}

/// A loaded allocator module.
pub struct GrallocModule<B: Backend> {
    context: Arc<DeviceContext<B>>,
}

impl<B: Backend> GrallocModule<B> {
    pub fn new(backend: B) -> Self {
        GrallocModule {
            context: Arc::new(DeviceContext::new(backend)),
        }
    }

    pub fn info(&self) -> &'static ModuleInfo {
        &MODULE_INFO
    }

    pub fn context(&self) -> &DeviceContext<B> {
        &self.context
    }

    /// Opens an allocation device. Only `"gpu0"` is known.
    pub fn open(&self, name: &str) -> Result<AllocationDevice<B>> {
        if name != GPU0 {
            return Err(AllocError::invalid_argument(format!(
                "unknown device {:?}",
                name
            )));
        }
        AllocationDevice::open(self.context.clone())
    }

    /// Establishes local state for `handle`, importing it if this module has none.
    pub fn register_buffer(&self, handle: &BufferHandle) -> Result<()> {
        let mut state = self.context.lock();
        let (device, registry) = state.device_and_registry(self.context.backend())?;

        if let Some(object) = registry.get_mut(handle.id()) {
            object.registrations += 1;
            log::trace!(
                "buffer {} registered again ({} registrations)",
                handle.id(),
                object.registrations
            );
            return Ok(());
        }

        let buffer = device.import_buffer(handle).map_err(|e| {
            log::warn!("failed to import buffer {}: {}", handle.id(), e);
            AllocError::InvalidHandle
        })?;
        registry.insert(
            handle.id(),
            BufferObject::imported(*handle.desc(), handle.stride(), buffer),
        );
        log::debug!("buffer {} imported", handle.id());
        Ok(())
    }

    /// Drops one registration of `handle`.
    ///
    /// Imported buffers are destroyed with their last registration; buffers
    /// allocated here stay until freed. Does not need a device context.
    pub fn unregister_buffer(&self, handle: &BufferHandle) -> Result<()> {
        let mut state = self.context.lock();
        let object = state
            .registry
            .get_mut(handle.id())
            .ok_or(AllocError::InvalidHandle)?;
        if object.release() {
            state.registry.remove(handle.id());
            log::debug!("buffer {} unregistered and released", handle.id());
        }
        Ok(())
    }

    /// Maps `region` of the buffer for CPU access with `usage`.
    ///
    /// Returns the address of the region's first pixel; rows are
    /// `handle.stride()` bytes apart. The mapping stays valid until `unlock`.
    pub fn lock(&self, handle: &BufferHandle, usage: Usage, region: Region) -> Result<NonNull<u8>> {
        let mut state = self.context.lock();
        let object = state
            .registry
            .get_mut(handle.id())
            .ok_or(AllocError::InvalidHandle)?;

        if !region.fits(object.desc.width, object.desc.height) {
            return Err(AllocError::invalid_argument(format!(
                "region {:?} outside {}x{} buffer",
                region, object.desc.width, object.desc.height
            )));
        }
        check_lock_usage(object.desc.usage, usage)?;

        let addr = object.buffer.map(usage, region)?;
        log::trace!("buffer {} lock usage = {:08x}", handle.id(), usage.bits());
        Ok(addr)
    }

    /// Releases the CPU mapping made by `lock`.
    pub fn unlock(&self, handle: &BufferHandle) -> Result<()> {
        let mut state = self.context.lock();
        let object = state
            .registry
            .get_mut(handle.id())
            .ok_or(AllocError::InvalidHandle)?;
        object.buffer.unmap()?;
        log::trace!("buffer {} unlocked", handle.id());
        Ok(())
    }

    pub fn perform(&self, request: PerformRequest) -> Result<PerformResponse> {
        let mut state = self.context.lock();
        let device = state.device_or_init(self.context.backend())?;
        match request {
            PerformRequest::GetDeviceFd => Ok(PerformResponse::DeviceFd(device.fd())),
            // TODO: compute the usage a consumer should allocate with once the
            // host defines the query's arguments.
            PerformRequest::GetUsage => Ok(PerformResponse::Done),
        }
    }

    /// `perform` for a raw host operation code.
    ///
    /// Unknown codes are rejected before the device context is touched.
    pub fn perform_raw(&self, code: u32) -> Result<PerformResponse> {
        let request = PerformRequest::try_from(code)?;
        self.perform(request)
    }

    /// How `handle` came to have local state here, if it has any.
    pub fn origin(&self, handle: &BufferHandle) -> Option<Origin> {
        self.context
            .lock()
            .registry
            .get(handle.id())
            .map(|object| object.origin)
    }
}

/// Rejects a lock whose usage the allocation did not ask for, unless the
/// buffer was made for SW reads, the framebuffer or texturing.
///
/// A buffer allocated without any usage can be locked for anything.
fn check_lock_usage(allocated: Usage, requested: Usage) -> Result<()> {
    if allocated.is_empty() || allocated.contains(requested) {
        return Ok(());
    }
    if allocated.intersects(Usage::SW_READ_OFTEN | Usage::HW_FB | Usage::HW_TEXTURE) {
        return Ok(());
    }
    log::error!(
        "buffer usage {:#x} does not allow lock usage {:#x}",
        allocated.bits(),
        requested.bits()
    );
    Err(AllocError::invalid_argument(format!(
        "lock usage {:#x} not allowed for buffer usage {:#x}",
        requested.bits(),
        allocated.bits()
    )))
}

#[cfg(not(feature = "gbm"))]
pub type DefaultBackend = crate::memfd::MemfdBackend;

#[cfg(feature = "gbm")]
pub type DefaultBackend = crate::gbm_node::GbmBackend;

/// The process-wide module instance the host runtime loads.
pub fn hal_module() -> &'static GrallocModule<DefaultBackend> {
    static MODULE: OnceLock<GrallocModule<DefaultBackend>> = OnceLock::new();
    MODULE.get_or_init(|| {
        #[cfg(feature = "gbm")]
        let backend = crate::gbm_node::GbmBackend::new(crate::gbm_node::GbmConfig::from_env());
        #[cfg(not(feature = "gbm"))]
        let backend = crate::memfd::MemfdBackend::default();
        GrallocModule::new(backend)
    })
}
