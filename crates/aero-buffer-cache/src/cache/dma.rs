use tracing::trace;

use super::BufferCache;
use crate::addr::GpuAddr;
use crate::buffer::NULL_BUFFER_ID;
use crate::memory::{DeviceMemory, GpuMemory};
use crate::runtime::{BufferCopy, BufferRuntime};
use crate::tracker::MemoryTracker;

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    /// Copy engine transfer of `amount` bytes between two cached regions.
    ///
    /// Returns `false` when neither side is cached; the caller then copies guest memory itself.
    pub fn dma_copy(&mut self, src_gpu: GpuAddr, dst_gpu: GpuAddr, amount: u64) -> bool {
        let (Some(src_addr), Some(dst_addr)) = (
            self.gpu_memory.gpu_to_cpu_address(src_gpu),
            self.gpu_memory.gpu_to_cpu_address(dst_gpu),
        ) else {
            return false;
        };
        if !self.is_region_registered(src_addr, amount)
            && !self.is_region_registered(dst_addr, amount)
        {
            return false;
        }
        self.clear_download(dst_addr, amount);

        let (src_id, dst_id) = loop {
            self.channel.has_deleted_buffers = false;
            let src_id = self.find_buffer(src_addr, amount);
            let dst_id = self.find_buffer(dst_addr, amount);
            if !self.channel.has_deleted_buffers {
                break (src_id, dst_id);
            }
        };
        if src_id == NULL_BUFFER_ID || dst_id == NULL_BUFFER_ID {
            return false;
        }
        self.synchronize_buffer(src_id, src_addr, amount);
        self.synchronize_buffer(dst_id, dst_addr, amount);

        let mut mirrored = Vec::new();
        self.gpu_modified_ranges
            .for_each_in_range(src_addr, amount, |start, end| {
                mirrored.push((dst_addr + (start - src_addr), end - start));
            });
        // Subtract before adding so overlapping copies keep the mirrored ranges.
        self.gpu_modified_ranges.subtract(dst_addr, amount);
        for &(addr, size) in &mirrored {
            self.gpu_modified_ranges.add(addr, size);
            self.uncommitted_gpu_modified_ranges.add(addr, size);
        }

        let src = &self.slot_buffers[src_id];
        let dst = &self.slot_buffers[dst_id];
        let copy = BufferCopy {
            src_offset: src.offset(src_addr),
            dst_offset: dst.offset(dst_addr),
            size: amount,
        };
        let (src_host, dst_host) = (src.host(), dst.host());
        self.runtime.copy_buffer(dst_host, src_host, &[copy], true);
        if !mirrored.is_empty() {
            self.tracker.mark_region_as_gpu_modified(dst_addr, amount);
        }

        let mut data = vec![0; amount as usize];
        self.memory.read_block(src_addr, &mut data);
        self.memory.write_block(dst_addr, &data);

        self.stats.inc_dma_copies();
        trace!(src_addr, dst_addr, amount, mirrored = mirrored.len(), "dma copy");
        true
    }

    /// Fill `word_count` little-endian words at `dst_gpu` with `value`.
    ///
    /// Returns `false` when the region is not cached.
    pub fn dma_clear(&mut self, dst_gpu: GpuAddr, word_count: u64, value: u32) -> bool {
        let Some(dst_addr) = self.gpu_memory.gpu_to_cpu_address(dst_gpu) else {
            return false;
        };
        let Some(size) = word_count.checked_mul(4) else {
            return false;
        };
        if !self.is_region_registered(dst_addr, size) {
            return false;
        }
        self.clear_download(dst_addr, size);
        self.gpu_modified_ranges.subtract(dst_addr, size);

        let id = self.find_buffer(dst_addr, size);
        if id == NULL_BUFFER_ID {
            return false;
        }
        let buffer = &self.slot_buffers[id];
        let (host, offset) = (buffer.host(), buffer.offset(dst_addr));
        self.runtime.clear_buffer(host, offset, size, value);
        self.mark_written_buffer(id, dst_addr, size);

        self.stats.inc_dma_clears();
        trace!(dst_addr, size, value, "dma clear");
        true
    }
}
