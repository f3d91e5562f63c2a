use crate::addr::{DEFAULT_CACHING_PAGE_BITS, DEVICE_PAGE_BITS};
use crate::error::BufferCacheError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Garbage collection knobs, in frames and buffers per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    /// Buffers unused for this many frames are collected under normal pressure.
    pub normal_retire_ticks: u64,
    /// Retirement window once usage crosses the critical watermark.
    pub aggressive_retire_ticks: u64,
    pub normal_max_deletions: usize,
    pub aggressive_max_deletions: usize,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            normal_retire_ticks: 120,
            aggressive_retire_ticks: 60,
            normal_max_deletions: 32,
            aggressive_max_deletions: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCacheConfig {
    /// log2 of the caching page size; buffers are aligned to and sized in these pages.
    pub caching_page_bits: u32,
    /// Guest addresses at or above `1 << address_space_bits` are never cached.
    pub address_space_bits: u32,
    /// Minimum-memory watermark used when the runtime cannot report device memory.
    pub expected_memory: u64,
    /// Critical-memory watermark used when the runtime cannot report device memory.
    pub critical_memory: u64,
    pub gc: GcPolicy,
    /// Uniform buffers up to this size may take the direct-upload path.
    pub uniform_skip_cache_size: u32,
    /// The direct-upload path is enabled while `hits * 256 < shots * threshold`.
    pub fast_uniform_hit_threshold: u32,
    /// Accumulated merge score after which a region is treated as a stream buffer.
    pub stream_leap_threshold: u32,
    /// Caching pages added to a stream buffer on its growing side.
    pub stream_leap_pages: u64,
    /// Frames a destroyed host buffer is kept alive before the runtime frees it.
    pub delayed_destruction_frames: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        Self {
            caching_page_bits: DEFAULT_CACHING_PAGE_BITS,
            address_space_bits: 34,
            expected_memory: 512 * MIB,
            critical_memory: GIB,
            gc: GcPolicy::default(),
            uniform_skip_cache_size: 4096,
            fast_uniform_hit_threshold: 251,
            stream_leap_threshold: 16,
            stream_leap_pages: 128,
            delayed_destruction_frames: 8,
        }
    }
}

impl BufferCacheConfig {
    pub fn caching_page_size(&self) -> u64 {
        1 << self.caching_page_bits
    }

    pub fn address_space_end(&self) -> u64 {
        1 << self.address_space_bits
    }

    pub fn validate(&self) -> Result<(), BufferCacheError> {
        if self.caching_page_bits < DEVICE_PAGE_BITS {
            return Err(BufferCacheError::InvalidConfig(
                "caching_page_bits must be at least the device page size",
            ));
        }
        if self.address_space_bits > 63 || self.address_space_bits <= self.caching_page_bits {
            return Err(BufferCacheError::InvalidConfig(
                "address_space_bits must be within (caching_page_bits, 63]",
            ));
        }
        if self.critical_memory < self.expected_memory {
            return Err(BufferCacheError::InvalidConfig(
                "critical_memory must be >= expected_memory",
            ));
        }
        if self.fast_uniform_hit_threshold > 256 {
            return Err(BufferCacheError::InvalidConfig(
                "fast_uniform_hit_threshold is a fraction of 256",
            ));
        }
        if self.gc.aggressive_retire_ticks > self.gc.normal_retire_ticks {
            return Err(BufferCacheError::InvalidConfig(
                "aggressive GC must not retire buffers later than normal GC",
            ));
        }
        if self.delayed_destruction_frames == 0 {
            return Err(BufferCacheError::InvalidConfig(
                "delayed_destruction_frames must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BufferCacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.caching_page_size(), 64 * 1024);
        assert_eq!(config.address_space_end(), 16 * GIB);
    }

    #[test]
    fn rejects_pages_smaller_than_device_pages() {
        let config = BufferCacheConfig {
            caching_page_bits: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BufferCacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let config = BufferCacheConfig {
            expected_memory: 2 * GIB,
            critical_memory: GIB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
