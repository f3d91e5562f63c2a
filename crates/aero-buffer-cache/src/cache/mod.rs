//! The buffer cache proper.
//!
//! The implementation is split by concern:
//! - `overlap`: lookup and creation of buffers, merging overlapping ones.
//! - `sync`: guest <-> host transfers and CPU write notifications.
//! - `binding`: per-draw slot state, resolution and host binds.
//! - `flush`: the asynchronous download pipeline.
//! - `dma`: engine-driven copies and fills.

mod binding;
mod dma;
mod flush;
mod overlap;
mod sync;

pub use binding::{ObtainBufferOperation, ObtainBufferSynchronize, ObtainedBuffer};
pub use sync::DownloadArea;

use std::collections::VecDeque;

use tracing::debug;

use crate::addr::{align_up, DeviceAddr};
use crate::bindings::ChannelState;
use crate::buffer::{Buffer, BufferFlags, BufferId, NULL_BUFFER_ID};
use crate::config::BufferCacheConfig;
use crate::error::BufferCacheError;
use crate::eviction::{BufferLru, DelayedDestructionRing, MemoryBudget};
use crate::memory::{DeviceMemory, GpuMemory};
use crate::page_table::PageTable;
use crate::range_set::{OverlapRangeSet, RangeSet};
use crate::runtime::{BufferCopy, BufferRuntime, HostBuffer, StagingBuffer};
use crate::slot::SlotVector;
use crate::stats::BufferCacheStats;
use crate::tracker::{MemoryTracker, RangeMemoryTracker};

/// Memory accounting granularity for buffers registered without runtime usage reporting.
const MEMORY_ACCOUNTING_ALIGNMENT: u64 = 1024;

/// Downloads recorded by one submitted flush generation.
#[derive(Debug, Default)]
struct PendingDownload {
    /// `src_offset` is the guest address; `dst_offset` is relative to the staging buffer.
    copies: Vec<BufferCopy>,
    /// Bytes of `copies` that have not been invalidated since submission.
    live: RangeSet,
}

/// Keeps host buffer objects coherent with the guest memory they mirror.
///
/// `R` executes host commands, `M` is guest memory, `G` translates GPU virtual addresses and `K`
/// tracks CPU/GPU modifications per byte range.
pub struct BufferCache<R, M, G, K = RangeMemoryTracker>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    config: BufferCacheConfig,
    runtime: R,
    memory: M,
    gpu_memory: G,
    tracker: K,

    slot_buffers: SlotVector<Buffer>,
    page_table: PageTable,
    lru: BufferLru,
    delayed_destruction_ring: DelayedDestructionRing<HostBuffer>,
    channel: ChannelState,

    gpu_modified_ranges: RangeSet,
    uncommitted_gpu_modified_ranges: RangeSet,
    committed_gpu_modified_ranges: Vec<RangeSet>,
    async_downloads: OverlapRangeSet,
    async_buffers: VecDeque<Option<StagingBuffer>>,
    pending_downloads: VecDeque<PendingDownload>,
    async_buffers_death_ring: Vec<StagingBuffer>,

    budget: MemoryBudget,
    estimated_memory: u64,
    frame_tick: u64,
    stats: BufferCacheStats,
}

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    pub fn new(
        config: BufferCacheConfig,
        runtime: R,
        memory: M,
        gpu_memory: G,
    ) -> Result<Self, BufferCacheError>
    where
        K: Default,
    {
        Self::with_tracker(config, runtime, memory, gpu_memory, K::default())
    }

    pub fn with_tracker(
        config: BufferCacheConfig,
        mut runtime: R,
        memory: M,
        gpu_memory: G,
        tracker: K,
    ) -> Result<Self, BufferCacheError> {
        config.validate()?;
        let capabilities = runtime.capabilities();
        let budget = MemoryBudget::new(&config, capabilities.device_local_memory);

        let mut slot_buffers = SlotVector::new();
        let null_host = runtime.create_buffer(0);
        let null_id = slot_buffers.insert(Buffer::new(null_host, 0, 0));
        debug_assert_eq!(null_id, NULL_BUFFER_ID);

        debug!(
            caching_page_size = config.caching_page_size(),
            minimum_memory = budget.minimum_memory,
            critical_memory = budget.critical_memory,
            "buffer cache created"
        );

        Ok(Self {
            page_table: PageTable::new(config.caching_page_bits),
            delayed_destruction_ring: DelayedDestructionRing::new(
                config.delayed_destruction_frames,
            ),
            config,
            runtime,
            memory,
            gpu_memory,
            tracker,
            slot_buffers,
            lru: BufferLru::new(),
            channel: ChannelState::new(),
            gpu_modified_ranges: RangeSet::new(),
            uncommitted_gpu_modified_ranges: RangeSet::new(),
            committed_gpu_modified_ranges: Vec::new(),
            async_downloads: OverlapRangeSet::new(),
            async_buffers: VecDeque::new(),
            pending_downloads: VecDeque::new(),
            async_buffers_death_ring: Vec::new(),
            budget,
            estimated_memory: 0,
            frame_tick: 0,
            stats: BufferCacheStats::new(),
        })
    }

    pub fn config(&self) -> &BufferCacheConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Direct guest memory access. Writes made through this bypass coherency tracking; follow
    /// them with [`Self::write_memory`] or [`Self::on_cpu_write`].
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn gpu_memory(&self) -> &G {
        &self.gpu_memory
    }

    pub fn gpu_memory_mut(&mut self) -> &mut G {
        &mut self.gpu_memory
    }

    pub fn tracker(&self) -> &K {
        &self.tracker
    }

    pub fn stats(&self) -> &BufferCacheStats {
        &self.stats
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn frame_tick(&self) -> u64 {
        self.frame_tick
    }

    /// Host memory in use: reported by the runtime when it can, estimated otherwise.
    pub fn memory_usage(&self) -> u64 {
        if self.runtime.capabilities().device_local_memory.is_some() {
            self.runtime.device_memory_usage()
        } else {
            self.estimated_memory
        }
    }

    /// Live buffers, not counting the null buffer.
    pub fn buffer_count(&self) -> usize {
        self.slot_buffers.len() - 1
    }

    pub fn is_buffer_valid(&self, id: BufferId) -> bool {
        self.slot_buffers.contains(id)
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.slot_buffers.get(id)
    }

    /// Live buffers other than the null buffer.
    pub fn buffers(&self) -> impl Iterator<Item = (BufferId, &Buffer)> + '_ {
        self.slot_buffers
            .iter()
            .filter(|&(id, _)| id != NULL_BUFFER_ID)
    }

    /// `(id, addr, size)` of every live buffer carrying all of `flags`.
    pub(crate) fn flagged_buffers(&self, flags: BufferFlags) -> Vec<(BufferId, DeviceAddr, u64)> {
        self.buffers()
            .filter(|(_, buffer)| buffer.flags().contains(flags))
            .map(|(id, buffer)| (id, buffer.cpu_addr(), buffer.size_bytes()))
            .collect()
    }

    /// Buffer owning the caching page of `addr`.
    pub fn buffer_at(&self, addr: DeviceAddr) -> Option<BufferId> {
        self.page_table.lookup(addr)
    }

    pub fn is_region_registered(&self, addr: DeviceAddr, size: u64) -> bool {
        !self.buffers_in_range(addr, size).is_empty()
    }

    /// Buffers overlapping `[addr, addr + size)` in address order.
    pub(crate) fn buffers_in_range(&self, addr: DeviceAddr, size: u64) -> Vec<BufferId> {
        let mut ids = Vec::new();
        if size == 0 {
            return ids;
        }
        let pages = self.page_table.pages_of(addr, size);
        let mut page = pages.start;
        while page < pages.end {
            let Some(id) = self.page_table.get(page) else {
                page += 1;
                continue;
            };
            ids.push(id);
            page = self
                .page_table
                .page_of(self.slot_buffers[id].end_addr())
                .max(page + 1);
        }
        ids
    }

    pub(crate) fn null_host(&self) -> HostBuffer {
        self.slot_buffers[NULL_BUFFER_ID].host()
    }

    fn register(&mut self, id: BufferId) {
        let buffer = &self.slot_buffers[id];
        let (addr, size) = (buffer.cpu_addr(), buffer.size_bytes());
        self.page_table.register(addr, size, id);
        self.lru.insert(id, self.frame_tick);
        self.estimated_memory += align_up(size, MEMORY_ACCOUNTING_ALIGNMENT);
    }

    fn unregister(&mut self, id: BufferId) {
        let buffer = &self.slot_buffers[id];
        let (addr, size) = (buffer.cpu_addr(), buffer.size_bytes());
        self.page_table.unregister(addr, size, id);
        self.lru.remove(id);
        self.estimated_memory = self
            .estimated_memory
            .saturating_sub(align_up(size, MEMORY_ACCOUNTING_ALIGNMENT));
    }

    pub(crate) fn touch_buffer(&mut self, id: BufferId) {
        if id != NULL_BUFFER_ID {
            self.lru.touch(id, self.frame_tick);
        }
    }

    /// Destroy a buffer, clearing every binding that references it.
    ///
    /// Unless `do_not_mark` is set (the contents were copied into a replacement), the range is
    /// handed back to guest memory: pending downloads are forgotten and the bytes become
    /// CPU-modified so any future buffer re-uploads them.
    pub(crate) fn delete_buffer(&mut self, id: BufferId, do_not_mark: bool) {
        if id == NULL_BUFFER_ID {
            return;
        }
        let Some(buffer) = self.slot_buffers.get(id) else {
            return;
        };
        let (addr, size, host) = (buffer.cpu_addr(), buffer.size_bytes(), buffer.host());

        for binding in self.channel.bindings_mut() {
            if binding.buffer_id == Some(id) {
                binding.buffer_id = None;
            }
        }

        if !do_not_mark {
            self.clear_download(addr, size);
            self.gpu_modified_ranges.subtract(addr, size);
            self.tracker.mark_region_as_cpu_modified(addr, size);
        }

        self.unregister(id);
        self.slot_buffers.remove(id);
        self.delayed_destruction_ring.push(host);
        self.channel.has_deleted_buffers = true;
    }

    /// Advance one frame: adapt the uniform policy, run garbage collection and release host
    /// objects whose destruction delay expired.
    pub fn tick_frame(&mut self) {
        self.runtime.tick_frame();

        let (hits, shots) = self.channel.rotate_uniform_counters();
        let skip_preferred = u64::from(hits) * 256
            < u64::from(shots) * u64::from(self.config.fast_uniform_hit_threshold);
        self.channel.uniform_buffer_skip_cache_size = if skip_preferred {
            self.config.uniform_skip_cache_size
        } else {
            0
        };

        self.download_per_frame_buffers();

        if self.memory_usage() >= self.budget.minimum_memory {
            self.run_garbage_collector();
        }

        self.frame_tick += 1;
        for host in self.delayed_destruction_ring.tick() {
            self.runtime.destroy_buffer(host);
        }
        for staging in self.async_buffers_death_ring.drain(..) {
            self.runtime.free_deferred_staging_buffer(staging);
        }
    }

    fn download_per_frame_buffers(&mut self) {
        for (id, addr, size) in self.flagged_buffers(BufferFlags::DOWNLOAD_EACH_FRAME) {
            self.download_buffer_memory(id, addr, size);
        }
    }

    fn run_garbage_collector(&mut self) {
        let aggressive = self.memory_usage() >= self.budget.critical_memory;
        let gc = self.config.gc;
        let (window, max_deletions) = if aggressive {
            (gc.aggressive_retire_ticks, gc.aggressive_max_deletions)
        } else {
            (gc.normal_retire_ticks, gc.normal_max_deletions)
        };
        let Some(threshold) = self.frame_tick.checked_sub(window) else {
            return;
        };

        let victims = self.lru.stale(threshold, max_deletions);
        if victims.is_empty() {
            return;
        }
        debug!(
            aggressive,
            count = victims.len(),
            usage = self.memory_usage(),
            "collecting stale buffers"
        );
        for id in victims {
            let buffer = &self.slot_buffers[id];
            let (addr, size) = (buffer.cpu_addr(), buffer.size_bytes());
            self.download_buffer_memory(id, addr, size);
            self.delete_buffer(id, false);
            self.stats.inc_buffers_evicted();
        }
    }

    /// Flush everything pending and release every buffer.
    ///
    /// Waits for the runtime, retires all in-flight download generations, writes any remaining
    /// GPU-modified bytes back to guest memory and destroys all host objects. The cache stays
    /// usable afterwards with only the null buffer alive.
    pub fn teardown(&mut self) {
        self.runtime.finish();
        while !self.async_buffers.is_empty() {
            self.pop_async_flushes();
        }

        let live: Vec<(BufferId, DeviceAddr, u64)> = self
            .buffers()
            .map(|(id, buffer)| (id, buffer.cpu_addr(), buffer.size_bytes()))
            .collect();
        debug!(buffers = live.len(), "tearing down buffer cache");
        for &(id, addr, size) in &live {
            self.download_buffer_memory(id, addr, size);
        }
        for (id, _, _) in live {
            self.delete_buffer(id, true);
        }
        self.uncommitted_gpu_modified_ranges.clear();
        self.committed_gpu_modified_ranges.clear();
        self.gpu_modified_ranges.clear();

        for host in self.delayed_destruction_ring.drain() {
            self.runtime.destroy_buffer(host);
        }
        for staging in self.async_buffers_death_ring.drain(..) {
            self.runtime.free_deferred_staging_buffer(staging);
        }
    }

    /// Consume the cache, returning its collaborators.
    pub fn into_parts(self) -> (R, M, G, K) {
        (self.runtime, self.memory, self.gpu_memory, self.tracker)
    }

    #[cfg(test)]
    pub(crate) fn assert_page_table_consistent(&self) {
        for (page, id) in self.page_table.iter() {
            let buffer = &self.slot_buffers[id];
            let page_addr = page << self.config.caching_page_bits;
            assert!(buffer.cpu_addr() <= page_addr && page_addr < buffer.end_addr());
        }
        let page_bits = self.config.caching_page_bits;
        let registered: u64 = self
            .buffers()
            .map(|(_, buffer)| buffer.size_bytes() >> page_bits)
            .sum();
        assert_eq!(registered, self.page_table.len() as u64);
    }
}
