//! Graphics memory allocator module
//!
//! Implements the allocation-device contract a host graphics runtime loads:
//! `open`/`close` an allocation device, `allocate`/`free` buffers through
//! it, and `register_buffer`/`unregister_buffer`/`lock`/`unlock`/`perform`
//! on handles from any source. Buffers come from a pluggable backend: GBM on
//! a DRM render node (feature `gbm`) or anonymous shared memory.
//!
//! All state of a module instance sits behind one mutex; the backend device
//! is created on first use and destroyed when an allocation device closes.

mod alloc_device;
mod backend;
mod context;
mod error;
mod format;
mod handle;
pub mod memfd;
mod module;
mod registry;

#[cfg(feature = "gbm")]
pub mod gbm_node;

pub use alloc_device::AllocationDevice;
pub use backend::{Backend, BackendBuffer, BackendDevice, Region};
pub use context::DeviceContext;
pub use error::{AllocError, Result};
pub use format::{PixelFormat, Usage};
pub use handle::{BufferDesc, BufferHandle, BufferId};
pub use module::{
    hal_module, DefaultBackend, GrallocModule, ModuleInfo, PerformRequest, PerformResponse, GPU0,
    MODULE_INFO,
};
pub use registry::Origin;
