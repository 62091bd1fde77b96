//! Anonymous shared memory backend
//!
//! Buffers live in memfd files, which can be passed to other processes and
//! mapped there. No GPU is involved; this backend serves software rendering
//! and hosts without a render node.

mod memory;

pub use memory::{MemfdBackend, MemfdBuffer, MemfdConfig, MemfdDevice};
