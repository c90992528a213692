//! CUDA memory backend for NVIDIA GPUs.
//!
//! Uses the CUDA driver API through `cudarc`, on the device's primary
//! context. Native values are `CUdeviceptr`s.

use std::sync::Arc;

use cudarc::driver::{result, CudaDevice as CudarcDevice};

use super::MemoryBackend;
use crate::device::DeviceId;
use crate::error::{BackendKind, MemoryError, MemoryResult};

/// Release status when the primary context cannot be bound.
pub const RELEASE_CONTEXT_UNAVAILABLE: i64 = -2;

/// CUDA memory backend bound to one device ordinal.
pub struct CudaBackend {
    ordinal: usize,
    device: Arc<CudarcDevice>,
}

impl CudaBackend {
    /// Create a backend for a specific device ordinal.
    pub fn new(ordinal: usize) -> MemoryResult<Self> {
        let device = CudarcDevice::new(ordinal)
            .map_err(|e| MemoryError::backend(BackendKind::Cuda, e.to_string()))?;

        tracing::info!("Initialized CUDA backend on device {}", ordinal);
        Ok(Self { ordinal, device })
    }

    /// Number of CUDA devices visible to this process.
    pub fn device_count() -> MemoryResult<usize> {
        result::init()?;
        let count = result::device::get_count()?;
        Ok(count as usize)
    }

    /// Get the device ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn bind(&self, device: DeviceId) -> MemoryResult<()> {
        if device.index() as usize != self.ordinal {
            return Err(MemoryError::backend(
                BackendKind::Cuda,
                format!("device {} is not served by ordinal {}", device, self.ordinal),
            ));
        }
        self.device.bind_to_thread()?;
        Ok(())
    }
}

impl MemoryBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "CUDA"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn allocate(&self, device: DeviceId, byte_count: u64) -> MemoryResult<u64> {
        self.bind(device)?;
        let len = usize::try_from(byte_count)
            .map_err(|_| MemoryError::allocation(byte_count, "exceeds host address space"))?;

        // SAFETY: the primary context is bound to this thread.
        let ptr = unsafe { result::malloc_sync(len) }
            .map_err(|e| MemoryError::allocation(byte_count, e.to_string()))?;

        tracing::debug!("cuMemAlloc {} bytes at {:#x} on device {}", byte_count, ptr, device);
        Ok(ptr)
    }

    fn release(&self, device: DeviceId, native_value: u64) -> i64 {
        if self.bind(device).is_err() {
            return RELEASE_CONTEXT_UNAVAILABLE;
        }
        // SAFETY: `native_value` came from `malloc_sync` and the address
        // protocol calls this at most once per allocation.
        match unsafe { result::free_sync(native_value) } {
            Ok(()) => 0,
            Err(e) => e.0 as i64,
        }
    }

    fn copy_in(&self, device: DeviceId, native_value: u64, src: &[u8]) -> MemoryResult<()> {
        self.bind(device)?;
        // SAFETY: range checked by the caller against the owning region.
        unsafe { result::memcpy_htod_sync(native_value, src) }
            .map_err(|e| MemoryError::TransferFailed(e.to_string()))
    }

    fn copy_out(&self, device: DeviceId, native_value: u64, dst: &mut [u8]) -> MemoryResult<()> {
        self.bind(device)?;
        // SAFETY: range checked by the caller against the owning region.
        unsafe { result::memcpy_dtoh_sync(dst, native_value) }
            .map_err(|e| MemoryError::TransferFailed(e.to_string()))
    }

    fn fill(
        &self,
        device: DeviceId,
        native_value: u64,
        byte_count: u64,
        value: u8,
    ) -> MemoryResult<()> {
        self.bind(device)?;
        let len = usize::try_from(byte_count)
            .map_err(|_| MemoryError::TransferFailed(format!("fill of {} bytes", byte_count)))?;
        // SAFETY: range checked by the caller against the owning region.
        unsafe { result::memset_d8_sync(native_value, value, len) }
            .map_err(|e| MemoryError::TransferFailed(e.to_string()))
    }
}
