//! Host element types for transfers.

use std::mem;

mod sealed {
    pub trait Sealed {}
}

/// A primitive type that can be copied between host and device memory.
///
/// Implemented for the fixed-width integer and floating point types. Every
/// bit pattern of these types is valid and they have no padding, so a slice
/// of them can be viewed as bytes in both directions.
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    /// `log2(size_of::<Self>())`.
    const LOG2_SIZE: u32;
}

macro_rules! impl_element {
    ($($ty:ty => $log2:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const LOG2_SIZE: u32 = $log2;
            }
        )*
    };
}

impl_element! {
    u8 => 0,
    i8 => 0,
    u16 => 1,
    i16 => 1,
    u32 => 2,
    i32 => 2,
    f32 => 2,
    u64 => 3,
    i64 => 3,
    f64 => 3,
}

/// View elements as raw bytes.
pub(crate) fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: `Element` types have no padding and the byte view covers
    // exactly the same memory with a weaker alignment.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, mem::size_of_val(data)) }
}

/// View elements as mutable raw bytes.
pub(crate) fn as_bytes_mut<T: Element>(data: &mut [T]) -> &mut [u8] {
    let len = mem::size_of_val(data);
    // SAFETY: as above, and every byte pattern is a valid `Element`.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, len) }
}
