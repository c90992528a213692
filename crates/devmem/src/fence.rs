//! Reachability fences.
//!
//! A native call that only receives a raw address does not, by itself, keep
//! the owner of that address alive. If nothing reads the owner after the raw
//! value has been extracted, the owner may be considered dead and its
//! release may run while the native call is still using the memory. The
//! sequence to guard is:
//!
//! ```rust,ignore
//! let raw = owner.native_value();
//! backend.copy_in(device, raw, bytes);   // owner not read again
//! fence::protect(&owner);                // owner is used up to here
//! ```
//!
//! `protect` must come *after* the native call, bracketing the span during
//! which the owner must stay alive.
//!
//! ## Tiers
//!
//! The implementation is chosen once per process and then fixed:
//!
//! 1. [`FenceTier::Intrinsic`]: `std::hint::black_box`, when the
//!    `intrinsic-fence` feature is enabled (the default).
//! 2. [`FenceTier::NativeCall`]: an opaque `extern "C"` no-op reached
//!    through a volatile function pointer, when the process configuration
//!    enables it.
//! 3. [`FenceTier::BestEffort`]: reads the value's type token and issues a
//!    compiler fence. This defeats straight-line dead-store elimination but
//!    is not a hard guarantee.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::OnceLock;

use crate::config::MemoryConfig;

/// Reachability fence implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceTier {
    /// Compiler-provided opaque use.
    Intrinsic,
    /// Opaque call across an `extern "C"` boundary.
    NativeCall,
    /// Type-token read plus compiler fence.
    BestEffort,
}

impl FenceTier {
    /// All tiers, strongest first.
    pub const ALL: [FenceTier; 3] = [
        FenceTier::Intrinsic,
        FenceTier::NativeCall,
        FenceTier::BestEffort,
    ];

    /// Selection rule: the intrinsic if available, else the native call if
    /// enabled, else best effort.
    pub fn select(intrinsic_available: bool, native_call_enabled: bool) -> Self {
        if intrinsic_available {
            FenceTier::Intrinsic
        } else if native_call_enabled {
            FenceTier::NativeCall
        } else {
            FenceTier::BestEffort
        }
    }

    /// Get the tier used by this process.
    pub fn current() -> Self {
        static TIER: OnceLock<FenceTier> = OnceLock::new();
        *TIER.get_or_init(|| {
            let tier = Self::select(
                intrinsic_available(),
                MemoryConfig::global().reachability_native_call,
            );
            tracing::debug!("Selected reachability fence tier: {}", tier);
            tier
        })
    }

    /// Check if this tier guarantees reachability (as opposed to mitigating).
    pub fn is_guaranteed(&self) -> bool {
        !matches!(self, FenceTier::BestEffort)
    }
}

impl fmt::Display for FenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FenceTier::Intrinsic => write!(f, "intrinsic"),
            FenceTier::NativeCall => write!(f, "native-call"),
            FenceTier::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Check if the intrinsic fence was compiled in.
pub const fn intrinsic_available() -> bool {
    cfg!(feature = "intrinsic-fence")
}

/// Keep `value` reachable at least until this call returns.
#[inline]
pub fn protect<T: ?Sized>(value: &T) {
    protect_with(FenceTier::current(), value);
}

/// Keep `value` reachable using a specific tier.
#[inline]
pub fn protect_with<T: ?Sized>(tier: FenceTier, value: &T) {
    match tier {
        FenceTier::Intrinsic => {
            let _ = std::hint::black_box(value);
        }
        FenceTier::NativeCall => protect_native(value),
        FenceTier::BestEffort => protect_best_effort(value),
    }
}

extern "C" fn keep_alive(referent: *const c_void) {
    let _ = referent;
}

static KEEP_ALIVE: extern "C" fn(*const c_void) = keep_alive;

#[inline(never)]
fn protect_native<T: ?Sized>(value: &T) {
    // A volatile load hides the callee, so the pointer escapes into an
    // unknown foreign function.
    let callee = unsafe { std::ptr::read_volatile(&KEEP_ALIVE) };
    callee(value as *const T as *const c_void);
}

#[inline(never)]
fn protect_best_effort<T: ?Sized>(value: &T) {
    let token = std::any::type_name_of_val(value);
    if token.is_empty() {
        panic!("reachability fence: type token of protected value is unreadable");
    }
    compiler_fence(Ordering::SeqCst);
}
