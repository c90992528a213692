//! Native memory backends.
//!
//! A backend is the collaborator that actually owns device memory. The
//! handle protocol only ever talks to it through [`MemoryBackend`], passing
//! raw native values; it never interprets those values itself.

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use host::{HostBackend, HostStats};

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use crate::device::DeviceId;
use crate::error::{BackendKind, MemoryResult};

/// Native memory operations for one kind of device.
///
/// All operations are synchronous: when a call returns, the native side is
/// done with the host buffer it was given.
pub trait MemoryBackend: Send + Sync + 'static {
    /// Get the backend name identifier.
    fn name(&self) -> &'static str;

    /// Get the backend kind, used for error context.
    fn kind(&self) -> BackendKind;

    /// Allocate `byte_count` bytes on `device`, returning the native address.
    fn allocate(&self, device: DeviceId, byte_count: u64) -> MemoryResult<u64>;

    /// Free an allocation made by [`allocate`](Self::allocate).
    ///
    /// Returns 0 on success and a non-zero status otherwise. Must never
    /// panic; the status is all the caller gets.
    fn release(&self, device: DeviceId, native_value: u64) -> i64;

    /// Copy `src` to device memory starting at `native_value`.
    fn copy_in(&self, device: DeviceId, native_value: u64, src: &[u8]) -> MemoryResult<()>;

    /// Copy device memory starting at `native_value` into `dst`.
    fn copy_out(&self, device: DeviceId, native_value: u64, dst: &mut [u8]) -> MemoryResult<()>;

    /// Set `byte_count` bytes starting at `native_value` to `value`.
    fn fill(&self, device: DeviceId, native_value: u64, byte_count: u64, value: u8)
        -> MemoryResult<()>;
}
