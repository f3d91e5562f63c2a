use tracing::{debug, trace, warn};

use super::BufferCache;
use crate::addr::{align_down, align_up, div_ceil, DeviceAddr};
use crate::buffer::{Buffer, BufferFlags, BufferId, NULL_BUFFER_ID};
use crate::memory::{DeviceMemory, GpuMemory};
use crate::runtime::{BufferCopy, BufferRuntime};
use crate::tracker::MemoryTracker;

/// Flags that follow a buffer's contents into the buffer replacing it.
const INHERITED_FLAGS: BufferFlags =
    BufferFlags::CACHED_WRITES.union(BufferFlags::DOWNLOAD_EACH_FRAME);

#[derive(Debug)]
struct OverlapResult {
    ids: Vec<BufferId>,
    begin: DeviceAddr,
    end: DeviceAddr,
    has_stream_leap: bool,
}

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    /// Buffer fully containing `[addr, addr + size)`, creating (and merging) one when needed.
    ///
    /// Address 0 and empty ranges resolve to the null buffer.
    pub fn find_buffer(&mut self, addr: DeviceAddr, size: u64) -> BufferId {
        if addr == 0 || size == 0 {
            return NULL_BUFFER_ID;
        }
        if addr
            .checked_add(size)
            .map_or(true, |end| end > self.config.address_space_end())
        {
            warn!(addr, size, "buffer request outside of the cached address space");
            return NULL_BUFFER_ID;
        }
        if let Some(id) = self.page_table.lookup(addr) {
            if self.slot_buffers[id].is_in_bounds(addr, size) {
                return id;
            }
        }
        self.create_buffer(addr, size)
    }

    /// Create a buffer covering `[addr, addr + size)` rounded to caching pages, absorbing every
    /// buffer that overlaps the rounded range.
    pub fn create_buffer(&mut self, addr: DeviceAddr, size: u64) -> BufferId {
        let page_size = self.config.caching_page_size();
        let begin = align_down(addr, page_size);
        let end = align_up(addr.saturating_add(size), page_size);
        let overlap = self.resolve_overlaps(begin, end);

        let size = overlap.end - overlap.begin;
        let host = self.runtime.create_buffer(size);
        let new_id = self
            .slot_buffers
            .insert(Buffer::new(host, overlap.begin, size));
        self.runtime.clear_buffer(host, 0, size, 0);

        for &overlap_id in &overlap.ids {
            self.join_overlap(new_id, overlap_id, !overlap.has_stream_leap);
        }
        self.register(new_id);
        self.touch_buffer(new_id);
        self.stats.inc_buffers_created();

        debug!(
            id = ?new_id,
            begin = overlap.begin,
            size,
            joined = overlap.ids.len(),
            stream_leap = overlap.has_stream_leap,
            "created buffer"
        );
        new_id
    }

    /// Union `[begin, end)` with every buffer owning one of its pages.
    ///
    /// When the merged buffers have been joined often enough the region is assumed to be a
    /// stream buffer and the result grows by a fixed number of pages on the side it is growing
    /// towards, so the next requests land inside it instead of forcing another merge.
    fn resolve_overlaps(&mut self, mut begin: DeviceAddr, mut end: DeviceAddr) -> OverlapResult {
        let page_bits = self.config.caching_page_bits;
        let page_size = self.config.caching_page_size();
        let leap = self.config.stream_leap_pages.saturating_mul(page_size);
        let address_space_end = self.config.address_space_end();

        let mut ids = Vec::new();
        let mut stream_score: u32 = 0;
        let mut has_stream_leap = false;

        let mut page = begin >> page_bits;
        while page < div_ceil(end, page_size) {
            let Some(overlap_id) = self.page_table.get(page) else {
                page += 1;
                continue;
            };
            let overlap = &mut self.slot_buffers[overlap_id];
            if overlap.is_picked() {
                page += 1;
                continue;
            }
            overlap.set_flags(BufferFlags::PICKED, true);
            ids.push(overlap_id);

            let overlap_begin = overlap.cpu_addr();
            let overlap_end = overlap.end_addr();
            let expands_left = overlap_begin < begin;
            let expands_right = overlap_end > end;
            begin = begin.min(overlap_begin);
            end = end.max(overlap_end);
            page = (overlap_end >> page_bits).max(page + 1);

            stream_score = stream_score.saturating_add(overlap.stream_score());
            if stream_score > self.config.stream_leap_threshold && !has_stream_leap {
                has_stream_leap = true;
                // An older buffer on the left means the region is growing to the right.
                if expands_left {
                    end = end.saturating_add(leap).min(address_space_end);
                }
                if expands_right {
                    // Never grow below the first caching page.
                    let floor = page_size.min(begin);
                    begin = begin.saturating_sub(leap).max(floor);
                    // Pages left of the previous begin have not been scanned yet.
                    page = begin >> page_bits;
                }
            }
        }

        for &id in &ids {
            self.slot_buffers[id].set_flags(BufferFlags::PICKED, false);
        }

        OverlapResult {
            ids,
            begin,
            end,
            has_stream_leap,
        }
    }

    /// Copy `overlap_id` into `new_id` and destroy it.
    fn join_overlap(
        &mut self,
        new_id: BufferId,
        overlap_id: BufferId,
        accumulate_stream_score: bool,
    ) {
        let overlap = &self.slot_buffers[overlap_id];
        let (overlap_host, overlap_addr, overlap_size) =
            (overlap.host(), overlap.cpu_addr(), overlap.size_bytes());
        let overlap_score = overlap.stream_score();
        let inherited = overlap.flags() & INHERITED_FLAGS;

        let new_buffer = &mut self.slot_buffers[new_id];
        if accumulate_stream_score {
            new_buffer.increase_stream_score(overlap_score.saturating_add(1));
        }
        new_buffer.set_flags(inherited, true);
        let copy = BufferCopy {
            src_offset: 0,
            dst_offset: new_buffer.offset(overlap_addr),
            size: overlap_size,
        };
        let new_host = new_buffer.host();

        self.runtime
            .copy_buffer(new_host, overlap_host, &[copy], true);
        self.delete_buffer(overlap_id, true);
        self.stats.inc_buffers_joined();
        trace!(into = ?new_id, from = ?overlap_id, size = overlap_size, "joined buffer");
    }
}
