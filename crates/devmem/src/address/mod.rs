//! Native addresses and their release discipline.
//!
//! An [`Address`] pairs an opaque native value (a device pointer or handle)
//! with the identity of the object that owns it. Addresses come in two
//! flavors:
//!
//! - **Root** addresses are created when a native resource is allocated and
//!   may carry a [`Cleaner`]. Closing a root runs its cleaner exactly once.
//! - **Slice** addresses are derived from a root by byte offset. They share
//!   the root's memory, never carry a cleaner, and always point directly at
//!   the root, however many times they were re-sliced.
//!
//! ```text
//!   root ──────────────────────────────┐
//!    ▲        ▲                        │ cleaner (release authority)
//!    │        │                        ▼
//!  slice   slice-of-slice        native allocation
//! ```
//!
//! Validity of a slice is always decided by its root: only the root's closed
//! flag reflects whether the backing allocation has actually been freed.

mod cleaner;

pub use cleaner::*;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU64;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::DeviceId;
use crate::error::{MemoryError, MemoryResult};

/// Identity of the object an address is tied to.
///
/// Used only for identity comparison and diagnostics; an `OwnerId` does not
/// keep anything alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    /// Allocate a fresh, process-unique owner identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 increments to wrap.
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Get the raw identity value.
    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Lineage {
    Root { cleaner: Option<Box<dyn Cleaner>> },
    Slice { root: Arc<Address> },
}

/// A handle to a native resource.
///
/// Addresses are immutable apart from their closed flag, which moves from
/// open to closed exactly once. Equality and hashing consider the native
/// value, the owner and the device, so two addresses with the same native
/// value but different owners are distinct.
pub struct Address {
    native_value: u64,
    owner: OwnerId,
    device_id: DeviceId,
    lineage: Lineage,
    closed: AtomicBool,
}

impl Address {
    /// Get the raw native value.
    pub fn native_value(&self) -> u64 {
        self.native_value
    }

    /// Get the owner identity.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Get the device this address lives on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Check if this is a root address.
    pub fn is_root(&self) -> bool {
        matches!(self.lineage, Lineage::Root { .. })
    }

    /// Get the root address (`self` for a root).
    pub fn root(&self) -> &Address {
        match &self.lineage {
            Lineage::Root { .. } => self,
            Lineage::Slice { root } => root,
        }
    }

    /// Byte offset of this address from its root.
    pub fn offset(&self) -> u64 {
        self.native_value - self.root().native_value
    }

    /// Was there already an attempt to release this address?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Check if this address has not been closed.
    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    /// Check if both this address and its root are open.
    ///
    /// A slice's own flag only changes when it is closed explicitly, so this
    /// is the check that tells whether the backing memory is still there.
    pub fn is_live(&self) -> bool {
        self.root().is_open() && self.is_open()
    }

    /// Release the native resource.
    ///
    /// Idempotent: only the first call does anything. For a root with a
    /// cleaner that call runs the cleaner; for slices and cleaner-less roots
    /// it only marks the address closed.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ReleaseFailed`] if the cleaner reports a
    /// non-zero status. The address stays closed; the resource has leaked.
    pub fn close(&self) -> MemoryResult<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let rc = self.try_release();
        if rc != 0 {
            tracing::error!("Failed to release {}: rc = {}", self, rc);
            return Err(MemoryError::release_failed(rc, self));
        }

        if self.is_root() {
            tracing::debug!("Released {}", self);
        }
        Ok(())
    }

    fn try_release(&self) -> i64 {
        match &self.lineage {
            Lineage::Root {
                cleaner: Some(cleaner),
            } => panic::catch_unwind(AssertUnwindSafe(|| cleaner.release(self)))
                .unwrap_or(CLEANER_PANICKED),
            _ => 0,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.native_value == other.native_value
            && self.owner == other.owner
            && self.device_id == other.device_id
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.native_value.hash(state);
        self.owner.hash(state);
        self.device_id.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Address: {:#x} @{} device {}, closed: {}]",
            self.native_value,
            self.owner,
            self.device_id,
            self.is_closed()
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Address");
        s.field("native_value", &format_args!("{:#x}", self.native_value))
            .field("owner", &self.owner)
            .field("device_id", &self.device_id)
            .field("closed", &self.is_closed());
        match &self.lineage {
            Lineage::Root { cleaner } => s.field("has_cleaner", &cleaner.is_some()),
            Lineage::Slice { root } => s.field("root", &format_args!("{}", root)),
        };
        s.finish()
    }
}

/// Factory for root and slice addresses.
pub struct Addresses;

impl Addresses {
    /// Create a root address.
    ///
    /// `cleaner` is the release strategy for the native resource; pass `None`
    /// for resources this process does not own.
    pub fn root(
        owner: OwnerId,
        native_value: u64,
        device_id: DeviceId,
        cleaner: Option<Box<dyn Cleaner>>,
    ) -> Arc<Address> {
        Arc::new(Address {
            native_value,
            owner,
            device_id,
            lineage: Lineage::Root { cleaner },
            closed: AtomicBool::new(false),
        })
    }

    /// Create a slice address `byte_offset` bytes past `parent`.
    ///
    /// The slice references the root of `parent`, not `parent` itself, so
    /// chains of slices stay one level deep.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::AlreadyClosed`] if the root has been closed.
    /// - [`MemoryError::InvalidArgument`] if the resulting address overflows.
    pub fn slice(
        shadow_owner: OwnerId,
        parent: &Arc<Address>,
        byte_offset: u64,
    ) -> MemoryResult<Arc<Address>> {
        let root = match &parent.lineage {
            Lineage::Root { .. } => Arc::clone(parent),
            Lineage::Slice { root } => Arc::clone(root),
        };

        // Same flag the close path flips: a slice minted here was minted
        // before the root's cleaner started.
        if root.is_closed() {
            return Err(MemoryError::AlreadyClosed(root.to_string()));
        }

        let native_value = parent.native_value.checked_add(byte_offset).ok_or_else(|| {
            MemoryError::InvalidArgument(format!(
                "byte offset {} overflows address {:#x}",
                byte_offset, parent.native_value
            ))
        })?;

        Ok(Arc::new(Address {
            native_value,
            owner: shadow_owner,
            device_id: parent.device_id,
            lineage: Lineage::Slice { root },
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn counting_cleaner(count: Arc<AtomicUsize>, rc: i64) -> Option<Box<dyn Cleaner>> {
        Some(Box::new(move |_: &Address| {
            count.fetch_add(1, Ordering::SeqCst);
            rc
        }))
    }

    #[test]
    fn test_root_close_runs_cleaner_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let root = Addresses::root(OwnerId::next(), 0x1000, DeviceId::new(0), counting_cleaner(count.clone(), 0));

        assert!(root.is_root());
        assert!(root.is_open());

        root.close().unwrap();
        root.close().unwrap();

        assert!(root.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_failure_reported_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let root = Addresses::root(OwnerId::next(), 0x2000, DeviceId::new(1), counting_cleaner(count.clone(), 5));

        let err = root.close().unwrap_err();
        match err {
            MemoryError::ReleaseFailed { code, address } => {
                assert_eq!(code, 5);
                assert!(address.contains("0x2000"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Already attempted: second close is silent.
        assert!(root.close().is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_cleaner_is_contained() {
        let cleaner: Box<dyn Cleaner> = Box::new(|_: &Address| -> i64 { panic!("cleaner bug") });
        let root = Addresses::root(OwnerId::next(), 0x3000, DeviceId::new(0), Some(cleaner));

        let err = root.close().unwrap_err();
        assert!(matches!(err, MemoryError::ReleaseFailed { code: CLEANER_PANICKED, .. }));
        assert!(root.is_closed());
    }

    #[test]
    fn test_root_without_cleaner() {
        let root = Addresses::root(OwnerId::next(), 0x4000, DeviceId::new(0), None);
        assert!(root.close().is_ok());
        assert!(root.is_closed());
    }

    #[test]
    fn test_slice_flattens_to_root() {
        let count = Arc::new(AtomicUsize::new(0));
        let root = Addresses::root(OwnerId::next(), 0x10_000, DeviceId::new(2), counting_cleaner(count.clone(), 0));

        let outer = Addresses::slice(OwnerId::next(), &root, 100).unwrap();
        let inner = Addresses::slice(OwnerId::next(), &outer, 20).unwrap();

        assert!(!outer.is_root());
        assert_eq!(outer.native_value(), 0x10_000 + 100);
        assert_eq!(inner.native_value(), 0x10_000 + 120);
        assert_eq!(inner.offset(), 120);
        assert!(std::ptr::eq(inner.root(), &*root));
        assert_eq!(inner.device_id(), DeviceId::new(2));

        // Slices carry no release authority.
        inner.close().unwrap();
        outer.close().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(root.is_open());
    }

    #[test]
    fn test_slice_of_closed_root_fails() {
        let root = Addresses::root(OwnerId::next(), 0x5000, DeviceId::new(0), None);
        let slice = Addresses::slice(OwnerId::next(), &root, 8).unwrap();
        root.close().unwrap();

        assert!(!slice.is_live());
        assert!(slice.is_open());

        let err = Addresses::slice(OwnerId::next(), &root, 8).unwrap_err();
        assert!(err.is_already_closed());

        // Through an outstanding slice too: the check goes to the root.
        let err = Addresses::slice(OwnerId::next(), &slice, 8).unwrap_err();
        assert!(err.is_already_closed());
        assert!(err.to_string().contains("0x5000"));
    }

    #[test]
    fn test_slice_overflow() {
        let root = Addresses::root(OwnerId::next(), u64::MAX - 4, DeviceId::new(0), None);
        let err = Addresses::slice(OwnerId::next(), &root, 16).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_identity() {
        let owner = OwnerId::next();
        let a = Addresses::root(owner, 0x6000, DeviceId::new(0), None);
        let b = Addresses::root(owner, 0x6000, DeviceId::new(0), None);
        let c = Addresses::root(OwnerId::next(), 0x6000, DeviceId::new(0), None);
        let d = Addresses::root(owner, 0x6000, DeviceId::new(1), None);

        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);

        let set: HashSet<_> = [&*a, &*b, &*c, &*d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_display() {
        let owner = OwnerId::next();
        let root = Addresses::root(owner, 0xff, DeviceId::new(3), None);
        let text = root.to_string();
        assert!(text.contains("0xff"));
        assert!(text.contains(&owner.to_string()));
        assert!(text.contains("closed: false"));

        root.close().unwrap();
        assert!(root.to_string().contains("closed: true"));
    }

    #[test]
    fn test_owner_ids_unique() {
        let a = OwnerId::next();
        let b = OwnerId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
