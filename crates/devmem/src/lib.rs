//! # devmem
//!
//! Lifetime management for handles to native device memory.
//!
//! This crate wraps raw native addresses (device pointers returned by a
//! driver) in handles that make releasing them safe under concurrency:
//!
//! - **Exactly-once release**: closing an [`Address`] runs its [`Cleaner`]
//!   at most once, whatever the number of racing callers.
//! - **Flattened slicing**: a [`DeviceMemory`] slice always points directly
//!   at its root, keeps it alive, and observes when it is closed.
//! - **Reachability fences**: every native call is followed by
//!   [`fence::protect`] on the owning handle, so the allocation cannot be
//!   released while the call is still using it.
//!
//! ## Quick Start
//!
//! ```rust
//! use devmem::{Device, DeviceMemory};
//!
//! # fn main() -> devmem::MemoryResult<()> {
//! let device = Device::host(0);
//! let memory = DeviceMemory::new(&device, 1024)?;
//!
//! let window = memory.slice(100, 200)?;
//! window.copy_from_host(&[7u8; 100])?;
//!
//! let mut out = [0u8; 4];
//! memory.fetch_to_host(&mut out, 0, 4)?;
//! memory.close()?;
//!
//! assert!(window.is_closed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `intrinsic-fence` (default): use `std::hint::black_box` as the fence
//! - `cuda`: NVIDIA CUDA driver backend

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod memory;

// Re-export commonly used types
pub use address::{Address, Addresses, Cleaner, OwnerId, CLEANER_PANICKED};
pub use backend::{HostBackend, HostStats, MemoryBackend};
pub use config::MemoryConfig;
pub use device::{Device, DeviceId};
pub use error::{BackendKind, ErrorKind, MemoryError, MemoryResult};
pub use fence::FenceTier;
pub use memory::{DeviceMemory, Element};

#[cfg(feature = "cuda")]
pub use backend::CudaBackend;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::address::{Address, Addresses, Cleaner, OwnerId};
    pub use crate::backend::MemoryBackend;
    pub use crate::device::{Device, DeviceId};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::memory::{DeviceMemory, Element};
}
