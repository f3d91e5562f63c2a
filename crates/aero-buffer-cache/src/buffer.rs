use bitflags::bitflags;

use crate::addr::DeviceAddr;
use crate::runtime::HostBuffer;
use crate::slot::SlotId;

/// Stable handle to a cached buffer.
pub type BufferId = SlotId;

/// Handle of the permanent zero-size buffer that unbound slots resolve to.
///
/// It is the first value inserted into a fresh cache, so it always occupies slot 0.
pub const NULL_BUFFER_ID: BufferId = SlotId::from_raw(0, 0);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u8 {
        /// Scratch bit owned by a single overlap-resolution pass.
        const PICKED = 1 << 0;
        /// Deferred CPU writes are pending inside the buffer's range.
        const CACHED_WRITES = 1 << 1;
        /// Contents must be written back to guest memory every frame (query results).
        const DOWNLOAD_EACH_FRAME = 1 << 2;
    }
}

/// A host buffer object backing a page-aligned range of guest memory.
#[derive(Debug)]
pub struct Buffer {
    host: HostBuffer,
    cpu_addr: DeviceAddr,
    size_bytes: u64,
    stream_score: u32,
    flags: BufferFlags,
}

impl Buffer {
    pub(crate) fn new(host: HostBuffer, cpu_addr: DeviceAddr, size_bytes: u64) -> Self {
        Self {
            host,
            cpu_addr,
            size_bytes,
            stream_score: 0,
            flags: BufferFlags::empty(),
        }
    }

    pub fn host(&self) -> HostBuffer {
        self.host
    }

    pub fn cpu_addr(&self) -> DeviceAddr {
        self.cpu_addr
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn end_addr(&self) -> DeviceAddr {
        self.cpu_addr + self.size_bytes
    }

    /// Byte offset of `addr` inside the buffer.
    pub fn offset(&self, addr: DeviceAddr) -> u64 {
        debug_assert!(addr >= self.cpu_addr);
        addr - self.cpu_addr
    }

    pub fn is_in_bounds(&self, addr: DeviceAddr, size: u64) -> bool {
        addr >= self.cpu_addr
            && addr
                .checked_add(size)
                .is_some_and(|end| end <= self.end_addr())
    }

    pub fn stream_score(&self) -> u32 {
        self.stream_score
    }

    pub(crate) fn increase_stream_score(&mut self, score: u32) {
        self.stream_score = self.stream_score.saturating_add(score);
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: BufferFlags, value: bool) {
        self.flags.set(flags, value);
    }

    pub(crate) fn is_picked(&self) -> bool {
        self.flags.contains(BufferFlags::PICKED)
    }
}
