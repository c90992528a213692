//! Release strategies for root addresses.

use super::Address;

/// Status code reported when a cleaner panics instead of returning.
pub const CLEANER_PANICKED: i64 = -1;

/// The capability that frees the native resource behind a root [`Address`].
///
/// Supplied by the owner of the native resource and attached only to root
/// addresses. It is invoked at most once per root.
///
/// # Contract
///
/// - Return `0` on success and any other value on failure. A non-zero code
///   means the native resource leaked; it is reported to the caller of
///   [`Address::close`] and never retried.
/// - Never panic. A panicking cleaner is contained and reported as
///   [`CLEANER_PANICKED`].
pub trait Cleaner: Send + Sync {
    /// Release the native resource identified by `address`.
    fn release(&self, address: &Address) -> i64;
}

impl<F> Cleaner for F
where
    F: Fn(&Address) -> i64 + Send + Sync,
{
    fn release(&self, address: &Address) -> i64 {
        self(address)
    }
}
