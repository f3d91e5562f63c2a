use tracing::trace;

use super::BufferCache;
use crate::addr::{align_down, align_up, DeviceAddr, DEVICE_PAGE_SIZE, STAGING_COPY_ALIGNMENT};
use crate::buffer::{BufferFlags, BufferId, NULL_BUFFER_ID};
use crate::memory::{DeviceMemory, GpuMemory};
use crate::runtime::{BufferCopy, BufferRuntime, HostBuffer};
use crate::tracker::MemoryTracker;

/// Device-page-aligned region a caller is about to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadArea {
    pub start_address: DeviceAddr,
    pub end_address: DeviceAddr,
    /// The region can be flushed ahead of time without waiting for the GPU.
    pub preemptive: bool,
}

fn device_page_span(addr: DeviceAddr, size: u64) -> (DeviceAddr, DeviceAddr) {
    (
        align_down(addr, DEVICE_PAGE_SIZE),
        align_up(addr.saturating_add(size), DEVICE_PAGE_SIZE),
    )
}

/// Staging layout for `ranges`: every range starts on a copy-aligned offset.
fn staging_offsets(ranges: &[(DeviceAddr, u64)]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(ranges.len());
    let mut total = 0;
    for &(_, size) in ranges {
        offsets.push(total);
        total += align_up(size, STAGING_COPY_ALIGNMENT);
    }
    (offsets, total)
}

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    /// Upload every CPU-modified byte of `[addr, addr + size)` into buffer `id`.
    ///
    /// Returns `true` when the range was already clean.
    pub fn synchronize_buffer(&mut self, id: BufferId, addr: DeviceAddr, size: u64) -> bool {
        if id == NULL_BUFFER_ID || size == 0 {
            return true;
        }
        let Some(buffer) = self.slot_buffers.get(id) else {
            return true;
        };
        debug_assert!(buffer.is_in_bounds(addr, size));
        let (host, buffer_addr) = (buffer.host(), buffer.cpu_addr());

        let mut ranges = Vec::new();
        self.tracker
            .for_each_upload_range(addr, size, &mut |start, len| ranges.push((start, len)));
        if ranges.is_empty() {
            return true;
        }
        self.upload_ranges(host, buffer_addr, &ranges);
        false
    }

    fn upload_ranges(
        &mut self,
        host: HostBuffer,
        buffer_addr: DeviceAddr,
        ranges: &[(DeviceAddr, u64)],
    ) {
        let bytes: u64 = ranges.iter().map(|&(_, size)| size).sum();
        if self.runtime.capabilities().use_memory_maps_for_uploads {
            let (offsets, total) = staging_offsets(ranges);
            let staging = self.runtime.upload_staging_buffer(total);
            let span = self.runtime.mapped_span(&staging);
            let mut copies = Vec::with_capacity(ranges.len());
            for (&(addr, size), &offset) in ranges.iter().zip(&offsets) {
                let start = offset as usize;
                self.memory
                    .read_block(addr, &mut span[start..start + size as usize]);
                copies.push(BufferCopy {
                    src_offset: staging.offset + offset,
                    dst_offset: addr - buffer_addr,
                    size,
                });
            }
            self.runtime
                .copy_buffer(host, staging.buffer, &copies, true);
        } else {
            for &(addr, size) in ranges {
                let mut data = vec![0; size as usize];
                self.memory.read_block(addr, &mut data);
                self.runtime
                    .immediate_upload(host, addr - buffer_addr, &data);
            }
        }
        self.stats.add_bytes_uploaded(bytes);
        trace!(?host, ranges = ranges.len(), bytes, "uploaded buffer ranges");
    }

    /// Write every GPU-modified byte of `[addr, addr + size)` held by buffer `id` back to guest
    /// memory, waiting for the runtime to finish.
    pub fn download_buffer_memory(&mut self, id: BufferId, addr: DeviceAddr, size: u64) {
        if id == NULL_BUFFER_ID {
            return;
        }
        let Some(buffer) = self.slot_buffers.get(id) else {
            return;
        };
        let (host, buffer_addr) = (buffer.host(), buffer.cpu_addr());
        let start = addr.max(buffer_addr);
        let end = addr.saturating_add(size).min(buffer.end_addr());
        if start >= end {
            return;
        }

        let mut modified = Vec::new();
        self.tracker
            .for_each_download_range(start, end - start, true, &mut |a, s| modified.push((a, s)));
        let mut ranges = Vec::new();
        for (range_addr, range_size) in modified {
            self.gpu_modified_ranges
                .for_each_in_range(range_addr, range_size, |s, e| ranges.push((s, e - s)));
        }
        if ranges.is_empty() {
            return;
        }
        for &(range_addr, range_size) in &ranges {
            self.clear_download(range_addr, range_size);
            self.gpu_modified_ranges.subtract(range_addr, range_size);
        }
        self.download_ranges(host, buffer_addr, &ranges);
    }

    fn download_ranges(
        &mut self,
        host: HostBuffer,
        buffer_addr: DeviceAddr,
        ranges: &[(DeviceAddr, u64)],
    ) {
        let bytes: u64 = ranges.iter().map(|&(_, size)| size).sum();
        if self.runtime.capabilities().use_memory_maps {
            let (offsets, total) = staging_offsets(ranges);
            let staging = self.runtime.download_staging_buffer(total, false);
            let copies: Vec<BufferCopy> = ranges
                .iter()
                .zip(&offsets)
                .map(|(&(addr, size), &offset)| BufferCopy {
                    src_offset: addr - buffer_addr,
                    dst_offset: staging.offset + offset,
                    size,
                })
                .collect();
            self.runtime.pre_copy_barrier();
            self.runtime
                .copy_buffer(staging.buffer, host, &copies, false);
            self.runtime.post_copy_barrier();
            self.runtime.finish();

            let span = self.runtime.mapped_span(&staging);
            for (&(addr, size), &offset) in ranges.iter().zip(&offsets) {
                let start = offset as usize;
                self.memory
                    .write_block(addr, &span[start..start + size as usize]);
            }
        } else {
            for &(addr, size) in ranges {
                let mut data = vec![0; size as usize];
                self.runtime
                    .immediate_download(host, addr - buffer_addr, &mut data);
                self.memory.write_block(addr, &data);
            }
        }
        self.stats.add_bytes_downloaded(bytes);
        trace!(?host, ranges = ranges.len(), bytes, "downloaded buffer ranges");
    }

    /// Write back every GPU-modified byte of `[addr, addr + size)`.
    pub fn download_memory(&mut self, addr: DeviceAddr, size: u64) {
        for id in self.buffers_in_range(addr, size) {
            self.download_buffer_memory(id, addr, size);
        }
    }

    /// The CPU wrote `[addr, addr + size)`: the guest copy wins over pending GPU results.
    pub fn write_memory(&mut self, addr: DeviceAddr, size: u64) {
        if self.is_region_gpu_modified(addr, size) {
            self.clear_download(addr, size);
            self.gpu_modified_ranges.subtract(addr, size);
        }
        self.tracker.mark_region_as_cpu_modified(addr, size);
    }

    /// Notify the cache of a CPU write.
    ///
    /// Returns `true` when the surrounding device pages hold GPU results the caller must flush
    /// before the write can be made visible; the write is not recorded in that case.
    pub fn on_cpu_write(&mut self, addr: DeviceAddr, size: u64) -> bool {
        if !self.is_region_registered(addr, size) {
            return false;
        }
        let (start, end) = device_page_span(addr, size);
        if self.is_region_gpu_modified(start, end - start) {
            return true;
        }
        self.write_memory(addr, size);
        false
    }

    /// Record a CPU write whose dirty marking waits for [`Self::flush_cached_writes`].
    ///
    /// When the surrounding pages are GPU-modified the bytes are pushed to the host buffer
    /// straight away instead.
    pub fn cached_write_memory(&mut self, addr: DeviceAddr, size: u64) {
        if !self.is_region_registered(addr, size) {
            return;
        }
        let (start, end) = device_page_span(addr, size);
        if !self.is_region_gpu_modified(start, end - start) {
            self.tracker.cached_cpu_write(addr, size);
            for id in self.buffers_in_range(addr, size) {
                self.slot_buffers[id]
                    .set_flags(BufferFlags::CACHED_WRITES, true);
            }
            return;
        }
        let mut data = vec![0; size as usize];
        self.memory.read_block(addr, &mut data);
        self.inline_memory_implementation(addr, &data);
    }

    /// Promote every deferred CPU write to a CPU modification.
    pub fn flush_cached_writes(&mut self) {
        for (id, addr, size) in self.flagged_buffers(BufferFlags::CACHED_WRITES) {
            self.tracker.flush_cached_writes(addr, size);
            self.slot_buffers[id]
                .set_flags(BufferFlags::CACHED_WRITES, false);
        }
    }

    /// Engine inline upload of `data` at `addr`.
    ///
    /// Returns `false` when the caller should write guest memory itself: the region is not
    /// cached, or its host copy holds nothing newer than guest memory.
    pub fn inline_memory(&mut self, addr: DeviceAddr, data: &[u8]) -> bool {
        let size = data.len() as u64;
        if !self.is_region_registered(addr, size) {
            return false;
        }
        let (start, end) = device_page_span(addr, size);
        if !self.is_region_gpu_modified(start, end - start) {
            return false;
        }
        self.inline_memory_implementation(addr, data);
        true
    }

    fn inline_memory_implementation(&mut self, addr: DeviceAddr, data: &[u8]) {
        let size = data.len() as u64;
        self.clear_download(addr, size);
        self.gpu_modified_ranges.subtract(addr, size);

        let id = self.find_buffer(addr, size);
        if id == NULL_BUFFER_ID {
            return;
        }
        self.synchronize_buffer(id, addr, size);
        let buffer = &self.slot_buffers[id];
        let (host, offset) = (buffer.host(), buffer.offset(addr));

        if self.runtime.capabilities().use_memory_maps_for_uploads {
            let staging = self.runtime.upload_staging_buffer(size);
            self.runtime.mapped_span(&staging).copy_from_slice(data);
            let copy = BufferCopy {
                src_offset: staging.offset,
                dst_offset: offset,
                size,
            };
            self.runtime
                .copy_buffer(host, staging.buffer, &[copy], true);
        } else {
            self.runtime.immediate_upload(host, offset, data);
        }
        self.memory.write_block(addr, data);
        self.tracker.unmark_region_as_gpu_modified(addr, size);
        self.stats.add_bytes_uploaded(size);
        trace!(addr, size, "inline upload");
    }

    pub fn get_flush_area(&mut self, addr: DeviceAddr, size: u64) -> DownloadArea {
        let (start, end) = device_page_span(addr, size);
        let mut area = DownloadArea {
            start_address: start,
            end_address: end,
            preemptive: true,
        };
        if self.tracker.is_region_preflushable(addr, size) {
            return area;
        }
        area.preemptive = !self.is_region_gpu_modified(start, end - start);
        self.tracker.mark_region_as_preflushable(start, end - start);
        area
    }

    /// The guest unmapped `[addr, addr + size)`.
    ///
    /// GPU results inside the range are dropped; results outside it but held by an affected
    /// buffer are written back first.
    pub fn unmap_memory(&mut self, addr: DeviceAddr, size: u64) {
        self.clear_download(addr, size);
        self.gpu_modified_ranges.subtract(addr, size);

        let end = addr.saturating_add(size);
        for id in self.buffers_in_range(addr, size) {
            let buffer = &self.slot_buffers[id];
            let (buffer_addr, buffer_end) = (buffer.cpu_addr(), buffer.end_addr());
            if buffer_addr < addr {
                self.download_buffer_memory(id, buffer_addr, addr - buffer_addr);
            }
            if buffer_end > end {
                self.download_buffer_memory(id, end, buffer_end - end);
            }
            self.delete_buffer(id, false);
        }
    }

    /// Forget `[addr, addr + size)` in every download set, committed or not.
    pub(crate) fn clear_download(&mut self, addr: DeviceAddr, size: u64) {
        self.async_downloads.delete_all(addr, size);
        self.uncommitted_gpu_modified_ranges.subtract(addr, size);
        for ranges in &mut self.committed_gpu_modified_ranges {
            ranges.subtract(addr, size);
        }
        for pending in &mut self.pending_downloads {
            pending.live.subtract(addr, size);
        }
    }

    /// The host copy of some byte in the range is newer than guest memory.
    pub fn is_region_gpu_modified(&self, addr: DeviceAddr, size: u64) -> bool {
        self.gpu_modified_ranges.intersects(addr, size)
    }

    pub fn is_region_cpu_modified(&self, addr: DeviceAddr, size: u64) -> bool {
        self.tracker.is_region_cpu_modified(addr, size)
    }

    /// The GPU wrote `[addr, addr + size)` of buffer `id`.
    pub(crate) fn mark_written_buffer(&mut self, id: BufferId, addr: DeviceAddr, size: u64) {
        if id == NULL_BUFFER_ID || size == 0 {
            return;
        }
        self.tracker.mark_region_as_gpu_modified(addr, size);
        self.gpu_modified_ranges.add(addr, size);
        self.uncommitted_gpu_modified_ranges.add(addr, size);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::buffer::BufferFlags;
    use crate::config::BufferCacheConfig;
    use crate::memory::{DeviceMemory, PagedGpuMemory, VecDeviceMemory};
    use crate::runtime::{BufferRuntime, RuntimeCapabilities, SoftBufferRuntime, TransferRecord};
    use crate::BufferCache;

    type TestCache = BufferCache<SoftBufferRuntime, VecDeviceMemory, PagedGpuMemory>;

    fn cache_with(runtime: SoftBufferRuntime) -> TestCache {
        BufferCache::new(
            BufferCacheConfig::default(),
            runtime,
            VecDeviceMemory::new(0x40_0000),
            PagedGpuMemory::new(),
        )
        .unwrap()
    }

    fn cache() -> TestCache {
        cache_with(SoftBufferRuntime::new())
    }

    fn host_bytes(cache: &TestCache, id: crate::BufferId, offset: usize, len: usize) -> Vec<u8> {
        let host = cache.buffer(id).unwrap().host();
        let contents = cache.runtime().buffer_contents(host).unwrap();
        contents[offset..offset + len].to_vec()
    }

    fn guest_bytes(cache: &TestCache, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        cache.memory().read_block(addr, &mut data);
        data
    }

    /// Buffer over `[0x1_0000, 0x2_0000)` with guest contents already uploaded.
    fn synced_buffer(cache: &mut TestCache) -> crate::BufferId {
        let id = cache.find_buffer(0x1_0000, 0x1_0000);
        cache.synchronize_buffer(id, 0x1_0000, 0x1_0000);
        cache.runtime_mut().clear_logs();
        id
    }

    #[test]
    fn synchronize_uploads_dirty_bytes_once() {
        let mut cache = cache();
        cache.memory_mut().write_block(0x1_0000, &[1, 2, 3, 4]);
        let id = cache.find_buffer(0x1_0000, 4);

        assert!(!cache.synchronize_buffer(id, 0x1_0000, 4));
        assert!(cache.synchronize_buffer(id, 0x1_0000, 4));
        assert_eq!(host_bytes(&cache, id, 0, 4), vec![1, 2, 3, 4]);
        assert_eq!(cache.runtime().uploads().len(), 1);
        assert_eq!(cache.stats().snapshot().bytes_uploaded, 4);
    }

    #[test]
    fn mapped_uploads_batch_ranges_into_one_copy() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);
        let copies_before = cache.runtime().copy_calls();

        cache.memory_mut().write_block(0x1_0010, &[7; 4]);
        cache.write_memory(0x1_0010, 4);
        cache.memory_mut().write_block(0x1_0100, &[8; 8]);
        cache.write_memory(0x1_0100, 8);

        assert!(!cache.synchronize_buffer(id, 0x1_0000, 0x1_0000));
        assert_eq!(cache.runtime().copy_calls(), copies_before + 1);
        let host = cache.buffer(id).unwrap().host();
        assert_eq!(
            cache.runtime().uploads(),
            &[
                TransferRecord {
                    buffer: host,
                    offset: 0x10,
                    size: 4
                },
                TransferRecord {
                    buffer: host,
                    offset: 0x100,
                    size: 8
                },
            ]
        );
        assert_eq!(host_bytes(&cache, id, 0x100, 8), vec![8; 8]);
    }

    #[test]
    fn unmapped_runtimes_upload_immediately() {
        let mut cache = cache_with(SoftBufferRuntime::with_capabilities(RuntimeCapabilities {
            use_memory_maps_for_uploads: false,
            ..Default::default()
        }));
        cache.memory_mut().write_block(0x1_0020, &[5; 16]);
        let id = cache.find_buffer(0x1_0020, 16);

        assert!(!cache.synchronize_buffer(id, 0x1_0020, 16));
        assert_eq!(cache.runtime().copy_calls(), 0);
        assert_eq!(host_bytes(&cache, id, 0x20, 16), vec![5; 16]);
    }

    #[test]
    fn download_writes_gpu_results_back_once() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);
        let host = cache.buffer(id).unwrap().host();
        cache.runtime_mut().immediate_upload(host, 0, &[9; 16]);
        cache.mark_written_buffer(id, 0x1_0000, 16);
        assert!(cache.is_region_gpu_modified(0x1_0000, 1));

        cache.download_memory(0x1_0000, 0x1000);
        assert_eq!(guest_bytes(&cache, 0x1_0000, 16), vec![9; 16]);
        assert!(!cache.is_region_gpu_modified(0x1_0000, 16));
        assert_eq!(cache.runtime().downloads().len(), 1);

        cache.download_memory(0x1_0000, 0x1000);
        assert_eq!(cache.runtime().downloads().len(), 1);
        // The downloaded bytes match the host copy, nothing needs uploading.
        assert!(!cache.is_region_cpu_modified(0x1_0000, 16));
    }

    #[test]
    fn cpu_writes_cancel_gpu_results() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);
        cache.mark_written_buffer(id, 0x1_0000, 16);

        cache.write_memory(0x1_0000, 16);
        assert!(!cache.is_region_gpu_modified(0x1_0000, 16));
        assert!(cache.is_region_cpu_modified(0x1_0000, 16));
        cache.download_memory(0x1_0000, 16);
        assert!(cache.runtime().downloads().is_empty());
    }

    #[test]
    fn on_cpu_write_reports_pending_gpu_results() {
        let mut cache = cache();
        assert!(!cache.on_cpu_write(0x8_0000, 4));

        let id = synced_buffer(&mut cache);
        assert!(!cache.on_cpu_write(0x1_2000, 4));
        assert!(cache.is_region_cpu_modified(0x1_2000, 4));

        cache.mark_written_buffer(id, 0x1_3010, 4);
        // Same device page as the GPU write.
        assert!(cache.on_cpu_write(0x1_3800, 4));
        assert!(!cache.is_region_cpu_modified(0x1_3800, 4));
    }

    #[test]
    fn cached_writes_wait_for_flush() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);

        let has_cached_writes = |cache: &TestCache| {
            let flags = cache.buffer(id).unwrap().flags();
            flags.contains(BufferFlags::CACHED_WRITES)
        };

        cache.cached_write_memory(0x1_0040, 8);
        assert!(has_cached_writes(&cache));
        assert!(!cache.is_region_cpu_modified(0x1_0040, 8));

        cache.flush_cached_writes();
        assert!(!has_cached_writes(&cache));
        assert!(cache.is_region_cpu_modified(0x1_0040, 8));
    }

    #[test]
    fn inline_memory_only_takes_gpu_modified_regions() {
        let mut cache = cache();
        assert!(!cache.inline_memory(0x8_0000, &[1; 8]));

        let id = synced_buffer(&mut cache);
        assert!(!cache.inline_memory(0x1_0000, &[1; 8]));

        cache.mark_written_buffer(id, 0x1_0000, 0x100);
        assert!(cache.inline_memory(0x1_0010, &[3; 8]));
        assert_eq!(host_bytes(&cache, id, 0x10, 8), vec![3; 8]);
        assert_eq!(guest_bytes(&cache, 0x1_0010, 8), vec![3; 8]);
        assert!(!cache.is_region_gpu_modified(0x1_0010, 8));
        assert!(cache.is_region_gpu_modified(0x1_0000, 0x10));
    }

    #[test]
    fn flush_area_is_preemptive_once_marked() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);
        cache.mark_written_buffer(id, 0x1_5000, 4);

        let area = cache.get_flush_area(0x1_5010, 0x10);
        assert_eq!((area.start_address, area.end_address), (0x1_5000, 0x1_6000));
        assert!(!area.preemptive);
        assert!(cache.get_flush_area(0x1_5010, 0x10).preemptive);
        assert!(cache.get_flush_area(0x1_7000, 4).preemptive);
    }

    #[test]
    fn unmap_keeps_results_outside_the_range() {
        let mut cache = cache();
        let id = synced_buffer(&mut cache);
        let host = cache.buffer(id).unwrap().host();
        cache.runtime_mut().immediate_upload(host, 0, &[4; 4]);
        cache.runtime_mut().immediate_upload(host, 0x8000, &[6; 4]);
        cache.mark_written_buffer(id, 0x1_0000, 4);
        cache.mark_written_buffer(id, 0x1_8000, 4);

        cache.unmap_memory(0x1_8000, 0x1000);
        assert!(!cache.is_buffer_valid(id));
        assert_eq!(guest_bytes(&cache, 0x1_0000, 4), vec![4; 4]);
        assert_eq!(guest_bytes(&cache, 0x1_8000, 4), vec![0; 4]);
        assert!(!cache.is_region_gpu_modified(0x1_0000, 0x1_0000));
        assert!(cache.is_region_cpu_modified(0x1_8000, 4));
    }
}
