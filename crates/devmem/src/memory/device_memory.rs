//! Device memory buffers.

use std::fmt;
use std::sync::Arc;

use super::element::{self, Element};
use crate::address::{Address, Addresses, Cleaner, OwnerId};
use crate::backend::MemoryBackend;
use crate::device::{Device, DeviceId};
use crate::error::{MemoryError, MemoryResult};
use crate::fence;

/// A region of memory on a specific device.
///
/// Data moves between the host and the device with
/// [`transfer_to_device`](Self::transfer_to_device) and
/// [`fetch_to_host`](Self::fetch_to_host). Sub-regions are views created by
/// [`slice`](Self::slice); they share the backing allocation but never free
/// it.
///
/// `DeviceMemory` is a shared handle: clones refer to the same region, and
/// [`DeviceMemory::ptr_eq`] tells whether two handles are the same instance.
///
/// When no longer required, a root region must be [`close`](Self::close)d.
/// Dropping the last handle of a root that was never closed releases it as
/// well, but logs a leak warning: that path is a safety net, not the
/// intended discipline.
///
/// # Lifecycle
///
/// ```text
/// Allocated ──slice()──► (new slice instance, same root)
///     │
///   close()
///     ▼
///   Closed   (root and every outstanding slice)
/// ```
#[derive(Clone)]
pub struct DeviceMemory {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    device_id: DeviceId,
    length: u64,
    address: Arc<Address>,
    /// Flattened root owner; `None` for a root.
    root: Option<DeviceMemory>,
    backend: Arc<dyn MemoryBackend>,
}

impl DeviceMemory {
    /// Allocate `byte_count` bytes on `device`.
    pub fn new(device: &Device, byte_count: u64) -> MemoryResult<Self> {
        let backend = Arc::clone(device.backend());
        let device_id = device.id();
        let native_value = backend.allocate(device_id, byte_count)?;

        let release_backend = Arc::clone(&backend);
        let cleaner: Box<dyn Cleaner> = Box::new(move |address: &Address| {
            release_backend.release(address.device_id(), address.native_value())
        });
        let address = Addresses::root(OwnerId::next(), native_value, device_id, Some(cleaner));

        tracing::debug!("Allocated {} bytes on {} device {}: {}", byte_count, backend.name(), device_id, address);

        Ok(Self {
            inner: Arc::new(MemoryInner {
                device_id,
                length: byte_count,
                address,
                root: None,
                backend,
            }),
        })
    }

    /// Returns the length in bytes of this region.
    pub fn length(&self) -> u64 {
        self.inner.length
    }

    /// Get the device this region lives on.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Check if this region owns its allocation (is not a slice).
    pub fn is_root(&self) -> bool {
        self.inner.root.is_none()
    }

    /// Get the identity of this region's address owner.
    pub fn owner(&self) -> OwnerId {
        self.inner.address.owner()
    }

    /// Get this region's address, for diagnostics.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Raw native value of this region's start.
    ///
    /// Only meaningful while the region is open; using it after
    /// [`close`](Self::close) is a use-after-free on the native side.
    pub fn native_value(&self) -> u64 {
        self.inner.address.native_value()
    }

    /// Check if two handles refer to the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Check if the backing allocation has been released.
    pub fn is_closed(&self) -> bool {
        !self.inner.address.is_live()
    }

    /// Create a view of bytes `[from_offset, to_offset)` of this region.
    ///
    /// Slicing the full range returns this same instance. Slices of slices
    /// refer directly to the root region.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidArgument`] if `from_offset > to_offset`.
    /// - [`MemoryError::IndexOutOfBounds`] if `to_offset > length`.
    /// - [`MemoryError::AlreadyClosed`] if the root has been closed.
    pub fn slice(&self, from_offset: u64, to_offset: u64) -> MemoryResult<DeviceMemory> {
        let length = self.inner.length;
        if from_offset == 0 && to_offset == length {
            return Ok(self.clone());
        }

        if from_offset > to_offset {
            return Err(MemoryError::InvalidArgument(format!(
                "from_offset ({}) > to_offset ({})",
                from_offset, to_offset
            )));
        }
        if to_offset > length {
            return Err(MemoryError::IndexOutOfBounds(format!(
                "to_offset: {} (length {})",
                to_offset, length
            )));
        }

        let address = self.resolve_address()?;
        let sliced = Addresses::slice(OwnerId::next(), address, from_offset)?;
        let root = self.root_owner().clone();

        tracing::debug!("Sliced [{}, {}) of {}: {}", from_offset, to_offset, address, sliced);

        Ok(Self {
            inner: Arc::new(MemoryInner {
                device_id: self.inner.device_id,
                length: to_offset - from_offset,
                address: sliced,
                root: Some(root),
                backend: Arc::clone(&self.inner.backend),
            }),
        })
    }

    /// Copy `data[from_index..to_index]` to the start of this region.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::InvalidArgument`] if `from_index > to_index`.
    /// - [`MemoryError::IndexOutOfBounds`] if `to_index > data.len()` or the
    ///   elements do not fit in this region.
    /// - [`MemoryError::AlreadyClosed`] if the root has been closed.
    /// - Native errors from the backend, verbatim.
    pub fn transfer_to_device<T: Element>(
        &self,
        data: &[T],
        from_index: usize,
        to_index: usize,
    ) -> MemoryResult<()> {
        range_check(data.len(), from_index, to_index)?;
        self.length_check(to_index - from_index, T::LOG2_SIZE)?;

        let address = self.resolve_address()?;
        let result = self.inner.backend.copy_in(
            self.inner.device_id,
            address.native_value(),
            element::as_bytes(&data[from_index..to_index]),
        );
        fence::protect(self.root_owner());
        result
    }

    /// Copy the start of this region into `data[from_index..to_index]`.
    ///
    /// # Errors
    ///
    /// Same as [`transfer_to_device`](Self::transfer_to_device).
    pub fn fetch_to_host<T: Element>(
        &self,
        data: &mut [T],
        from_index: usize,
        to_index: usize,
    ) -> MemoryResult<()> {
        range_check(data.len(), from_index, to_index)?;
        self.length_check(to_index - from_index, T::LOG2_SIZE)?;

        let address = self.resolve_address()?;
        let result = self.inner.backend.copy_out(
            self.inner.device_id,
            address.native_value(),
            element::as_bytes_mut(&mut data[from_index..to_index]),
        );
        fence::protect(self.root_owner());
        result
    }

    /// Copy all of `data` to the start of this region.
    pub fn copy_from_host<T: Element>(&self, data: &[T]) -> MemoryResult<()> {
        self.transfer_to_device(data, 0, data.len())
    }

    /// Fill all of `data` from the start of this region.
    pub fn copy_to_host<T: Element>(&self, data: &mut [T]) -> MemoryResult<()> {
        let len = data.len();
        self.fetch_to_host(data, 0, len)
    }

    /// Set every byte of this region to `value`.
    pub fn fill(&self, value: u8) -> MemoryResult<()> {
        let address = self.resolve_address()?;
        let result = self.inner.backend.fill(
            self.inner.device_id,
            address.native_value(),
            self.inner.length,
            value,
        );
        fence::protect(self.root_owner());
        result
    }

    /// Release this region.
    ///
    /// Closing a root frees the allocation and invalidates every slice of
    /// it; the slices notice on their next use. Closing a slice only retires
    /// that view. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// [`MemoryError::ReleaseFailed`] if the backend could not free the
    /// allocation. The region is closed regardless and will not retry.
    pub fn close(&self) -> MemoryResult<()> {
        self.inner.address.close()
    }

    fn root_owner(&self) -> &DeviceMemory {
        self.inner.root.as_ref().unwrap_or(self)
    }

    /// Get the address if this region and its root are both open.
    fn resolve_address(&self) -> MemoryResult<&Arc<Address>> {
        let address = &self.inner.address;
        let root_open = self
            .inner
            .root
            .as_ref()
            .map_or(true, |root| root.inner.address.is_open());

        if root_open && address.is_open() {
            return Ok(address);
        }

        // Defunct view: retire it. A slice has nothing to release and a root
        // is already closed, so there is no error worth reporting.
        let _ = address.close();
        Err(MemoryError::AlreadyClosed(
            self.root_owner().inner.address.to_string(),
        ))
    }

    fn length_check(&self, element_count: usize, log2_unit_size: u32) -> MemoryResult<()> {
        if element_count as u64 > self.inner.length >> log2_unit_size {
            return Err(MemoryError::IndexOutOfBounds(format!(
                "element count: {} (capacity {})",
                element_count,
                self.inner.length >> log2_unit_size
            )));
        }
        Ok(())
    }
}

fn range_check(length: usize, from_index: usize, to_index: usize) -> MemoryResult<()> {
    if from_index > to_index {
        return Err(MemoryError::InvalidArgument(format!(
            "from_index ({}) > to_index ({})",
            from_index, to_index
        )));
    }
    if to_index > length {
        return Err(MemoryError::IndexOutOfBounds(format!("to_index: {}", to_index)));
    }
    Ok(())
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if self.root.is_some() || self.address.is_closed() {
            return;
        }
        tracing::warn!("Device memory leaked without close, releasing on drop: {}", self.address);
        // A failure is already logged by `close`.
        let _ = self.address.close();
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("device_id", &self.inner.device_id)
            .field("length", &self.inner.length)
            .field("is_root", &self.is_root())
            .field("address", &format_args!("{}", self.inner.address))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    fn host() -> (Arc<HostBackend>, Device) {
        let backend = Arc::new(HostBackend::new());
        let device = Device::with_backend(0, backend.clone());
        (backend, device)
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceMemory>();
        assert_send_sync::<Address>();
    }

    #[test]
    fn test_allocate_and_close() {
        let (backend, device) = host();
        let memory = DeviceMemory::new(&device, 256).unwrap();

        assert_eq!(memory.length(), 256);
        assert!(memory.is_root());
        assert!(!memory.is_closed());
        assert_eq!(backend.stats().live_allocations, 1);

        memory.close().unwrap();
        memory.close().unwrap();
        assert!(memory.is_closed());
        assert_eq!(backend.stats().releases, 1);
    }

    #[test]
    fn test_drop_releases_leaked_root() {
        let (backend, device) = host();
        let memory = DeviceMemory::new(&device, 32).unwrap();
        let clone = memory.clone();

        drop(memory);
        assert_eq!(backend.stats().live_allocations, 1);

        drop(clone);
        assert_eq!(backend.stats().live_allocations, 0);
        assert_eq!(backend.stats().releases, 1);
    }

    #[test]
    fn test_slice_keeps_root_alive() {
        let (backend, device) = host();
        let root = DeviceMemory::new(&device, 64).unwrap();
        let slice = root.slice(8, 16).unwrap();

        drop(root);
        assert_eq!(backend.stats().live_allocations, 1);
        assert!(!slice.is_closed());

        drop(slice);
        assert_eq!(backend.stats().live_allocations, 0);
    }

    #[test]
    fn test_full_slice_is_identity() {
        let (_, device) = host();
        let memory = DeviceMemory::new(&device, 40).unwrap();
        let same = memory.slice(0, 40).unwrap();
        assert!(DeviceMemory::ptr_eq(&memory, &same));

        let part = memory.slice(0, 39).unwrap();
        assert!(!DeviceMemory::ptr_eq(&memory, &part));
        memory.close().unwrap();
    }

    #[test]
    fn test_slice_validation() {
        let (_, device) = host();
        let memory = DeviceMemory::new(&device, 10).unwrap();

        assert!(matches!(memory.slice(5, 4), Err(MemoryError::InvalidArgument(_))));
        assert!(matches!(memory.slice(0, 11), Err(MemoryError::IndexOutOfBounds(_))));
        assert_eq!(memory.slice(10, 10).unwrap().length(), 0);
        memory.close().unwrap();
    }

    #[test]
    fn test_slice_close_is_local() {
        let (backend, device) = host();
        let root = DeviceMemory::new(&device, 16).unwrap();
        let slice = root.slice(4, 8).unwrap();

        slice.close().unwrap();
        assert!(slice.is_closed());
        assert!(!root.is_closed());
        assert_eq!(backend.stats().releases, 0);

        let err = slice.fill(0).unwrap_err();
        assert!(err.is_already_closed());

        root.fill(1).unwrap();
        root.close().unwrap();
    }

    #[test]
    fn test_fill_and_fetch() {
        let (_, device) = host();
        let memory = DeviceMemory::new(&device, 8).unwrap();
        memory.fill(0x11).unwrap();
        memory.slice(2, 4).unwrap().fill(0x22).unwrap();

        let mut out = [0u8; 8];
        memory.copy_to_host(&mut out).unwrap();
        assert_eq!(out, [0x11, 0x11, 0x22, 0x22, 0x11, 0x11, 0x11, 0x11]);
        memory.close().unwrap();
    }

    #[test]
    fn test_range_check() {
        assert!(range_check(4, 0, 4).is_ok());
        assert!(range_check(4, 4, 4).is_ok());
        assert!(matches!(range_check(4, 3, 2), Err(MemoryError::InvalidArgument(_))));
        assert!(matches!(range_check(4, 0, 5), Err(MemoryError::IndexOutOfBounds(_))));
    }

    #[test]
    fn test_length_check_uses_element_size() {
        let (_, device) = host();
        let memory = DeviceMemory::new(&device, 10).unwrap();

        // 10 bytes hold two f32 values (8 bytes), not three.
        assert!(memory.copy_from_host(&[1.0f32, 2.0]).is_ok());
        let err = memory.copy_from_host(&[1.0f32, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, MemoryError::IndexOutOfBounds(_)));
        memory.close().unwrap();
    }
}
