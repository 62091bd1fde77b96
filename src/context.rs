//! The shared device context.
//!
//! One `DeviceContext` exists per module instance. It owns the backend, the
//! lazily created backend device and the buffer registry, all behind a
//! single mutex. Every operation that touches the device or a buffer holds
//! the guard for the whole critical section; the guard is dropped on every
//! return path.

use crate::backend::{Backend, BackendDevice};
use crate::error::Result;
use crate::registry::Registry;
use parking_lot::{Mutex, MutexGuard};

pub(crate) type BufferOf<B> = <<B as Backend>::Device as BackendDevice>::Buffer;

/// State guarded by the context mutex.
pub(crate) struct ContextState<B: Backend> {
    device: Option<B::Device>,
    pub(crate) registry: Registry<BufferOf<B>>,
}

impl<B: Backend> ContextState<B> {
    /// Returns the device, creating it first if it is absent.
    ///
    /// A failed creation leaves the device absent so a later call retries.
    pub(crate) fn device_or_init(&mut self, backend: &B) -> Result<&B::Device> {
        let device = self.take_or_create(backend)?;
        Ok(self.device.insert(device))
    }

    /// Like `device_or_init`, also handing out the registry alongside the device.
    pub(crate) fn device_and_registry(
        &mut self,
        backend: &B,
    ) -> Result<(&B::Device, &mut Registry<BufferOf<B>>)> {
        let device = self.take_or_create(backend)?;
        Ok((&*self.device.insert(device), &mut self.registry))
    }

    fn take_or_create(&mut self, backend: &B) -> Result<B::Device> {
        if let Some(device) = self.device.take() {
            return Ok(device);
        }
        let device = backend.create_device().map_err(|e| {
            log::error!("device context creation failed: {}", e);
            e
        })?;
        log::debug!("device context created (fd {})", device.fd());
        Ok(device)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.device.is_some()
    }
}

pub struct DeviceContext<B: Backend> {
    backend: B,
    state: Mutex<ContextState<B>>,
}

impl<B: Backend> DeviceContext<B> {
    pub fn new(backend: B) -> Self {
        DeviceContext {
            backend,
            state: Mutex::new(ContextState {
                device: None,
                registry: Registry::new(),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState<B>> {
        self.state.lock()
    }

    /// Creates the backend device unless it already exists.
    ///
    /// Concurrent callers serialize on the context mutex, so at most one
    /// creation attempt is in flight and later callers see its outcome.
    pub fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.lock();
        state.device_or_init(&self.backend).map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_initialized()
    }

    /// Drops the backend device. Returns false if there was none.
    ///
    /// Registered buffers are left in place; callers free them before closing.
    pub(crate) fn destroy(&self) -> bool {
        let mut state = self.lock();
        match state.device.take() {
            Some(device) => {
                if !state.registry.is_empty() {
                    log::warn!(
                        "destroying device context with {} live buffer(s)",
                        state.registry.len()
                    );
                }
                drop(device);
                log::debug!("device context destroyed");
                true
            }
            None => false,
        }
    }

    /// Number of buffers with local state.
    pub fn buffer_count(&self) -> usize {
        self.lock().registry.len()
    }
}
