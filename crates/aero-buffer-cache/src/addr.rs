//! Address types and alignment helpers shared by the cache.

/// Address in the emulated console's main memory (what the guest CPU sees).
pub type DeviceAddr = u64;

/// Address used by emulated GPU commands; translated through [`crate::GpuMemory`].
pub type GpuAddr = u64;

/// Granularity of guest memory pages as seen by the guest CPU.
pub const DEVICE_PAGE_BITS: u32 = 12;
pub const DEVICE_PAGE_SIZE: u64 = 1 << DEVICE_PAGE_BITS;

/// Default granularity of the spatial index and buffer alignment.
///
/// This is unrelated to the host CPU page size.
pub const DEFAULT_CACHING_PAGE_BITS: u32 = 16;

/// Staging copies are packed at this alignment so adjacent ranges never share a cache line.
pub(crate) const STAGING_COPY_ALIGNMENT: u64 = 64;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0. Saturates instead of overflowing.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Round `value` down to the nearest multiple of `alignment`.
pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value / alignment * alignment
}

pub(crate) fn div_ceil(value: u64, divisor: u64) -> u64 {
    debug_assert!(divisor > 0);
    value / divisor + u64::from(value % divisor != 0)
}
