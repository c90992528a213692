//! Host-memory backend.
//!
//! Serves "device memory" out of ordinary heap allocations. Native values
//! are the real addresses of those allocations, so slices resolve by plain
//! pointer arithmetic exactly as they would on a device. Every access is
//! bounds-checked against the allocation it falls in, and releasing an
//! unknown address reports a non-zero status instead of corrupting memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::MemoryBackend;
use crate::device::DeviceId;
use crate::error::{BackendKind, MemoryError, MemoryResult};

/// Release status for an address that is not a live allocation.
pub const RELEASE_UNKNOWN_ADDRESS: i64 = 1;

/// Release status for an address that belongs to a different device.
pub const RELEASE_WRONG_DEVICE: i64 = 2;

struct Allocation {
    device: DeviceId,
    len: usize,
    bytes: Box<[u8]>,
}

/// Host-memory backend.
pub struct HostBackend {
    allocations: Mutex<BTreeMap<u64, Allocation>>,
    capacity: Option<u64>,
    live_bytes: AtomicU64,
    allocation_count: AtomicU64,
    release_count: AtomicU64,
}

impl HostBackend {
    /// Create an unbounded host backend.
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(BTreeMap::new()),
            capacity: None,
            live_bytes: AtomicU64::new(0),
            allocation_count: AtomicU64::new(0),
            release_count: AtomicU64::new(0),
        }
    }

    /// Create a host backend that refuses to hold more than `max_bytes` live.
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            capacity: Some(max_bytes),
            ..Self::new()
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> HostStats {
        HostStats {
            allocations: self.allocation_count.load(Ordering::Relaxed),
            releases: self.release_count.load(Ordering::Relaxed),
            live_allocations: self.allocations.lock().len(),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }

    /// Run `f` on the `len` bytes at `native_value`.
    fn with_range<R>(
        &self,
        device: DeviceId,
        native_value: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> MemoryResult<R> {
        let mut allocations = self.allocations.lock();

        let (base, allocation) = allocations
            .range_mut(..=native_value)
            .next_back()
            .ok_or_else(|| unknown_address(native_value))?;

        let offset = usize::try_from(native_value - *base)
            .map_err(|_| unknown_address(native_value))?;
        if offset > allocation.len {
            return Err(unknown_address(native_value));
        }
        if allocation.device != device {
            return Err(MemoryError::TransferFailed(format!(
                "address {:#x} belongs to device {}, not {}",
                native_value, allocation.device, device
            )));
        }
        if len > allocation.len - offset {
            return Err(MemoryError::TransferFailed(format!(
                "{} bytes at {:#x} exceed allocation of {} bytes at {:#x}",
                len, native_value, allocation.len, base
            )));
        }

        Ok(f(&mut allocation.bytes[offset..offset + len]))
    }
}

fn unknown_address(native_value: u64) -> MemoryError {
    MemoryError::TransferFailed(format!("address {:#x} is not allocated", native_value))
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HostBackend {
    fn name(&self) -> &'static str {
        "Host"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn allocate(&self, device: DeviceId, byte_count: u64) -> MemoryResult<u64> {
        let len = usize::try_from(byte_count)
            .map_err(|_| MemoryError::allocation(byte_count, "exceeds host address space"))?;

        // Capacity check and accounting happen under the same lock as release.
        let mut allocations = self.allocations.lock();

        if let Some(capacity) = self.capacity {
            let live = self.live_bytes.load(Ordering::Relaxed);
            if live.saturating_add(byte_count) > capacity {
                return Err(MemoryError::allocation(
                    byte_count,
                    format!("host capacity {} bytes, {} in use", capacity, live),
                ));
            }
        }

        // Zero-length requests still get a distinct address.
        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve_exact(len.max(1))
            .map_err(|e| MemoryError::allocation(byte_count, e.to_string()))?;
        buffer.resize(len.max(1), 0u8);
        let bytes = buffer.into_boxed_slice();
        let native_value = bytes.as_ptr() as u64;

        allocations.insert(
            native_value,
            Allocation {
                device,
                len,
                bytes,
            },
        );
        self.live_bytes.fetch_add(byte_count, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        drop(allocations);

        tracing::debug!(
            "Host allocated {} bytes at {:#x} for device {}",
            byte_count,
            native_value,
            device
        );
        Ok(native_value)
    }

    fn release(&self, device: DeviceId, native_value: u64) -> i64 {
        let mut allocations = self.allocations.lock();
        match allocations.get(&native_value) {
            None => return RELEASE_UNKNOWN_ADDRESS,
            Some(allocation) if allocation.device != device => return RELEASE_WRONG_DEVICE,
            Some(_) => {}
        }

        if let Some(allocation) = allocations.remove(&native_value) {
            self.live_bytes
                .fetch_sub(allocation.len as u64, Ordering::Relaxed);
        }
        self.release_count.fetch_add(1, Ordering::Relaxed);
        0
    }

    fn copy_in(&self, device: DeviceId, native_value: u64, src: &[u8]) -> MemoryResult<()> {
        self.with_range(device, native_value, src.len(), |dst| {
            dst.copy_from_slice(src)
        })
    }

    fn copy_out(&self, device: DeviceId, native_value: u64, dst: &mut [u8]) -> MemoryResult<()> {
        self.with_range(device, native_value, dst.len(), |src| {
            dst.copy_from_slice(src)
        })
    }

    fn fill(
        &self,
        device: DeviceId,
        native_value: u64,
        byte_count: u64,
        value: u8,
    ) -> MemoryResult<()> {
        let len = usize::try_from(byte_count).map_err(|_| unknown_address(native_value))?;
        self.with_range(device, native_value, len, |dst| dst.fill(value))
    }
}

/// Host backend statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Total successful allocations.
    pub allocations: u64,
    /// Total successful releases.
    pub releases: u64,
    /// Allocations currently live.
    pub live_allocations: usize,
    /// Bytes currently live.
    pub live_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: DeviceId = DeviceId::new(0);

    #[test]
    fn test_allocate_and_release() {
        let backend = HostBackend::new();
        let addr = backend.allocate(DEV, 64).unwrap();
        assert_ne!(addr, 0);

        let stats = backend.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.live_bytes, 64);

        assert_eq!(backend.release(DEV, addr), 0);
        assert_eq!(backend.release(DEV, addr), RELEASE_UNKNOWN_ADDRESS);

        let stats = backend.stats();
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_copy_roundtrip_with_offset() {
        let backend = HostBackend::new();
        let addr = backend.allocate(DEV, 16).unwrap();

        backend.copy_in(DEV, addr + 4, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 8];
        backend.copy_out(DEV, addr, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let backend = HostBackend::new();
        let addr = backend.allocate(DEV, 8).unwrap();

        let err = backend.copy_in(DEV, addr + 4, &[0u8; 5]).unwrap_err();
        assert!(matches!(err, MemoryError::TransferFailed(_)));

        let err = backend.fill(DEV, addr, 9, 0xff).unwrap_err();
        assert!(matches!(err, MemoryError::TransferFailed(_)));

        // Exactly at the end is an empty, valid range.
        backend.copy_in(DEV, addr + 8, &[]).unwrap();
    }

    #[test]
    fn test_wrong_device() {
        let backend = HostBackend::new();
        let addr = backend.allocate(DEV, 8).unwrap();

        assert!(backend.copy_in(DeviceId::new(1), addr, &[1]).is_err());
        assert_eq!(backend.release(DeviceId::new(1), addr), RELEASE_WRONG_DEVICE);
        assert_eq!(backend.release(DEV, addr), 0);
    }

    #[test]
    fn test_fill() {
        let backend = HostBackend::new();
        let addr = backend.allocate(DEV, 4).unwrap();
        backend.fill(DEV, addr + 1, 2, 0xab).unwrap();

        let mut out = [0u8; 4];
        backend.copy_out(DEV, addr, &mut out).unwrap();
        assert_eq!(out, [0, 0xab, 0xab, 0]);
    }

    #[test]
    fn test_capacity_limit() {
        let backend = HostBackend::with_capacity(100);
        let a = backend.allocate(DEV, 60).unwrap();

        let err = backend.allocate(DEV, 50).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationFailed { size: 50, .. }));

        assert_eq!(backend.release(DEV, a), 0);
        assert!(backend.allocate(DEV, 50).is_ok());
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let backend = HostBackend::new();
        let err = backend.allocate(DEV, u64::MAX).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationFailed { size: u64::MAX, .. }));

        let stats = backend.stats();
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_capacity_limit_concurrent() {
        const THREADS: usize = 8;

        for _ in 0..50 {
            let backend = HostBackend::with_capacity(1000);
            let barrier = std::sync::Barrier::new(THREADS);

            let granted = std::thread::scope(|s| {
                let workers: Vec<_> = (0..THREADS)
                    .map(|_| {
                        let backend = &backend;
                        let barrier = &barrier;
                        s.spawn(move || {
                            barrier.wait();
                            backend.allocate(DEV, 300).is_ok()
                        })
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|w| w.join().unwrap())
                    .filter(|ok| *ok)
                    .count()
            });

            assert_eq!(granted, 3);
            assert_eq!(backend.stats().live_bytes, 900);
        }
    }

    #[test]
    fn test_zero_length_allocations_are_distinct() {
        let backend = HostBackend::new();
        let a = backend.allocate(DEV, 0).unwrap();
        let b = backend.allocate(DEV, 0).unwrap();
        assert_ne!(a, b);
        assert!(backend.copy_in(DEV, a, &[1]).is_err());
    }
}
