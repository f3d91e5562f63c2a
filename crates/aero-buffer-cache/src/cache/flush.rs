use tracing::{debug, trace};

use super::{BufferCache, PendingDownload};
use crate::addr::{align_up, DeviceAddr, STAGING_COPY_ALIGNMENT};
use crate::buffer::BufferId;
use crate::memory::{DeviceMemory, GpuMemory};
use crate::range_set::RangeSet;
use crate::runtime::{BufferCopy, BufferRuntime};
use crate::tracker::MemoryTracker;

/// Parts of `pieces` not covered by `set`.
fn without(pieces: Vec<(DeviceAddr, DeviceAddr)>, set: &RangeSet) -> Vec<(DeviceAddr, DeviceAddr)> {
    let mut out = Vec::with_capacity(pieces.len());
    for (start, end) in pieces {
        set.for_each_gap(start, end - start, |s, e| out.push((s, e)));
    }
    out
}

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    /// Close the current generation of GPU writes.
    pub fn accumulate_flushes(&mut self) {
        if self.uncommitted_gpu_modified_ranges.is_empty() {
            return;
        }
        let ranges = std::mem::take(&mut self.uncommitted_gpu_modified_ranges);
        self.committed_gpu_modified_ranges.push(ranges);
    }

    pub fn has_uncommitted_flushes(&self) -> bool {
        !self.uncommitted_gpu_modified_ranges.is_empty()
    }

    /// The oldest submitted generation carries downloads the caller must wait for before
    /// [`Self::pop_async_flushes`].
    pub fn should_wait_async_flushes(&self) -> bool {
        matches!(self.async_buffers.front(), Some(Some(_)))
    }

    /// Record downloads of every committed GPU write into one staging allocation.
    ///
    /// Always enqueues exactly one generation, empty when there is nothing to download, so pops
    /// stay paired with commits.
    pub fn commit_async_flushes(&mut self) {
        self.accumulate_flushes();
        if self.committed_gpu_modified_ranges.is_empty() {
            self.push_empty_generation();
            return;
        }

        // Bytes written again by a later generation are downloaded once, with the newest one.
        let committed = &mut self.committed_gpu_modified_ranges;
        for i in 0..committed.len() {
            let (older, newer) = committed.split_at_mut(i + 1);
            let current = &mut older[i];
            for ranges in newer.iter() {
                ranges.for_each(|start, end| current.subtract(start, end - start));
            }
        }

        let committed = std::mem::take(&mut self.committed_gpu_modified_ranges);
        let mut downloads: Vec<(BufferId, BufferCopy)> = Vec::new();
        let mut total_size = 0;
        for ranges in &committed {
            for (start, end) in ranges.iter() {
                for id in self.buffers_in_range(start, end - start) {
                    let buffer = &self.slot_buffers[id];
                    let buffer_addr = buffer.cpu_addr();
                    let clip_start = start.max(buffer_addr);
                    let clip_end = end.min(buffer.end_addr());

                    let mut modified = Vec::new();
                    self.tracker.for_each_download_range(
                        clip_start,
                        clip_end - clip_start,
                        false,
                        &mut |addr, size| modified.push((addr, size)),
                    );
                    for (addr, size) in modified {
                        self.gpu_modified_ranges.for_each_in_range(addr, size, |s, e| {
                            downloads.push((
                                id,
                                BufferCopy {
                                    src_offset: s - buffer_addr,
                                    dst_offset: total_size,
                                    size: e - s,
                                },
                            ));
                            total_size += align_up(e - s, STAGING_COPY_ALIGNMENT);
                        });
                    }
                }
            }
        }
        if downloads.is_empty() {
            self.push_empty_generation();
            return;
        }

        if !self.runtime.capabilities().use_memory_maps {
            for (id, copy) in downloads {
                let addr = self.slot_buffers[id].cpu_addr() + copy.src_offset;
                self.download_buffer_memory(id, addr, copy.size);
            }
            self.push_empty_generation();
            return;
        }

        let staging = self.runtime.download_staging_buffer(total_size, true);
        let mut pending = PendingDownload::default();
        let mut bytes = 0;
        self.runtime.pre_copy_barrier();
        for (id, mut copy) in downloads {
            copy.dst_offset += staging.offset;
            let buffer = &self.slot_buffers[id];
            let (host, guest_addr) = (buffer.host(), buffer.cpu_addr() + copy.src_offset);
            self.async_downloads.add(guest_addr, copy.size);
            pending.live.add(guest_addr, copy.size);
            self.runtime
                .copy_buffer(staging.buffer, host, &[copy], false);
            pending.copies.push(BufferCopy {
                src_offset: guest_addr,
                ..copy
            });
            bytes += copy.size;
        }
        self.runtime.post_copy_barrier();

        debug!(
            copies = pending.copies.len(),
            bytes,
            staging_size = total_size,
            in_flight = self.async_buffers.len() + 1,
            "committed async downloads"
        );
        self.pending_downloads.push_back(pending);
        self.async_buffers.push_back(Some(staging));
        self.stats.inc_async_commits();
    }

    fn push_empty_generation(&mut self) {
        self.async_buffers.push_back(None);
        self.pending_downloads.push_back(PendingDownload::default());
    }

    /// Retire the oldest submitted generation, writing its still-valid bytes to guest memory.
    ///
    /// The caller must have waited for the runtime to execute the generation's copies.
    pub fn pop_async_flushes(&mut self) {
        let Some(front) = self.async_buffers.pop_front() else {
            return;
        };
        let pending = self.pending_downloads.pop_front().unwrap_or_default();
        let Some(staging) = front else {
            return;
        };

        let mut released = Vec::new();
        let mut bytes = 0;
        let span = self.runtime.mapped_span(&staging);
        for copy in &pending.copies {
            let guest_addr = copy.src_offset;
            let local = (copy.dst_offset - staging.offset) as usize;

            let mut live = Vec::new();
            pending
                .live
                .for_each_in_range(guest_addr, copy.size, |s, e| live.push((s, e)));
            for &(live_start, live_end) in &live {
                let mut writes = Vec::new();
                self.async_downloads.for_each_in_range(
                    live_start,
                    live_end - live_start,
                    |s, e, _| writes.push((s, e)),
                );
                for (s, e) in writes {
                    let offset = local + (s - guest_addr) as usize;
                    self.memory
                        .write_block(s, &span[offset..offset + (e - s) as usize]);
                    bytes += e - s;
                }
                let live_size = live_end - live_start;
                self.async_downloads
                    .subtract(live_start, live_size, |s, e| released.push((s, e)));
            }
        }

        // Bytes the GPU wrote again after this generation was committed stay modified.
        let mut released = without(released, &self.uncommitted_gpu_modified_ranges);
        for ranges in &self.committed_gpu_modified_ranges {
            released = without(released, ranges);
        }
        for (start, end) in released {
            self.gpu_modified_ranges.subtract(start, end - start);
            self.tracker
                .unmark_region_as_gpu_modified(start, end - start);
        }

        self.async_buffers_death_ring.push(staging);
        self.stats.inc_async_pops();
        self.stats.add_bytes_downloaded(bytes);
        trace!(copies = pending.copies.len(), bytes, "retired async downloads");
    }
}
