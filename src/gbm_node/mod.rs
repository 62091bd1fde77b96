//! GBM backend
//!
//! Allocates buffer objects on a DRM render node through libgbm and shares
//! them as dma-buf descriptors. CPU access maps the exported dma-buf.

mod device;

pub use device::{GbmBackend, GbmBuffer, GbmConfig, GbmDevice};
