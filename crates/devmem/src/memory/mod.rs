//! Device memory regions.
//!
//! This module provides the user-facing buffer type, [`DeviceMemory`], and
//! the element types it can exchange with the host.

mod device_memory;
mod element;

pub use device_memory::*;
pub use element::*;
