//! Per-module buffer object registry.

use crate::handle::{BufferDesc, BufferId};
use std::collections::HashMap;

/// How a buffer object came to exist in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Created by `allocate`; only `free` releases it.
    Allocated,
    /// Imported by `register_buffer`; released when its last registration goes.
    Imported,
}

/// Local state backing one handle.
pub(crate) struct BufferObject<T> {
    pub desc: BufferDesc,
    /// Row stride in bytes, as reported by the backend.
    pub stride: u32,
    pub origin: Origin,
    pub registrations: u32,
    pub buffer: T,
}

impl<T> BufferObject<T> {
    pub fn allocated(desc: BufferDesc, stride: u32, buffer: T) -> Self {
        BufferObject {
            desc,
            stride,
            origin: Origin::Allocated,
            registrations: 0,
            buffer,
        }
    }

    pub fn imported(desc: BufferDesc, stride: u32, buffer: T) -> Self {
        BufferObject {
            desc,
            stride,
            origin: Origin::Imported,
            registrations: 1,
            buffer,
        }
    }

    /// Stride in pixels. Zero for a format without a known pixel size.
    pub fn pixel_stride(&self) -> u32 {
        match self.desc.format.bytes_per_pixel() {
            0 => 0,
            bpp => self.stride / bpp,
        }
    }

    /// Drops one registration. Returns true when the object should be destroyed.
    pub fn release(&mut self) -> bool {
        self.registrations = self.registrations.saturating_sub(1);
        self.origin == Origin::Imported && self.registrations == 0
    }
}

/// Maps handle identifiers to their local buffer objects.
pub(crate) struct Registry<T> {
    objects: HashMap<BufferId, BufferObject<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            objects: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: BufferId, object: BufferObject<T>) {
        if self.objects.insert(id, object).is_some() {
            log::warn!("buffer {} registered twice; previous state dropped", id);
        }
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferObject<T>> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut BufferObject<T>> {
        self.objects.get_mut(&id)
    }

    pub fn remove(&mut self, id: BufferId) -> Option<BufferObject<T>> {
        self.objects.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PixelFormat, Usage};

    fn desc() -> BufferDesc {
        BufferDesc {
            width: 10,
            height: 10,
            format: PixelFormat::RGB_888,
            usage: Usage::empty(),
        }
    }

    #[test]
    fn imported_released_on_last_registration() {
        let mut object = BufferObject::imported(desc(), 48, ());
        object.registrations += 1;
        assert!(!object.release());
        assert!(object.release());
    }

    #[test]
    fn allocated_never_released_by_unregister() {
        let mut object = BufferObject::allocated(desc(), 48, ());
        object.registrations += 1;
        assert!(!object.release());
        assert!(!object.release());
        assert_eq!(object.pixel_stride(), 16);
    }

    #[test]
    fn lookup_by_id() {
        let mut registry = Registry::new();
        let id = BufferId::new_unique();
        let other = BufferId::new_unique();
        registry.insert(id, BufferObject::allocated(desc(), 48, 7u8));
        assert_eq!(registry.get(id).map(|o| o.buffer), Some(7));
        assert!(registry.get(other).is_none());
        assert!(registry.remove(id).is_some());
        assert!(registry.is_empty());
    }
}
