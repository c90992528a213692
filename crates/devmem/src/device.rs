//! Device identity.
//!
//! Device ids are supplied by an external enumeration step and are passed
//! through unchecked; a [`Device`] pairs one with the backend that owns its
//! memory.

use std::fmt;
use std::sync::Arc;

use crate::backend::{HostBackend, MemoryBackend};

/// Opaque, non-negative device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a device ID.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index.
    pub const fn index(&self) -> u32 {
        self.0
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device on which memory can be allocated.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    backend: Arc<dyn MemoryBackend>,
}

impl Device {
    /// Create a device backed by a specific backend.
    pub fn with_backend(id: impl Into<DeviceId>, backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
        }
    }

    /// Create a device whose "device memory" lives in host memory.
    pub fn host(id: impl Into<DeviceId>) -> Self {
        Self::with_backend(id, Arc::new(HostBackend::new()))
    }

    /// Create a CUDA device for a specific ordinal.
    #[cfg(feature = "cuda")]
    pub fn cuda(ordinal: u32) -> crate::error::MemoryResult<Self> {
        let backend = crate::backend::cuda::CudaBackend::new(ordinal as usize)?;
        Ok(Self::with_backend(ordinal, Arc::new(backend)))
    }

    /// Get the device identifier.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Get the backend serving this device.
    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id() {
        let id = DeviceId::new(3);
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "3");
        assert_eq!(DeviceId::from(3), id);
    }

    #[test]
    fn test_host_device() {
        let device = Device::host(1);
        assert_eq!(device.id(), DeviceId::new(1));
        assert_eq!(device.backend().name(), "Host");
        assert!(format!("{:?}", device).contains("Host"));
    }
}
