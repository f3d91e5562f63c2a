//! Per-range CPU/GPU modification tracking.

use crate::addr::DeviceAddr;
use crate::range_set::RangeSet;

/// Tracks which guest bytes were written by the CPU since they were last uploaded, and which
/// were written by the GPU since they were last downloaded.
///
/// Memory the tracker has never seen is CPU-modified: the host copy is assumed stale until the
/// first upload.
pub trait MemoryTracker {
    fn is_region_cpu_modified(&self, addr: DeviceAddr, size: u64) -> bool;

    fn is_region_gpu_modified(&self, addr: DeviceAddr, size: u64) -> bool;

    fn is_region_preflushable(&self, addr: DeviceAddr, size: u64) -> bool;

    /// A CPU write wins over any GPU modification of the same bytes.
    fn mark_region_as_cpu_modified(&mut self, addr: DeviceAddr, size: u64);

    /// The host copy is now authoritative; the bytes no longer need uploading.
    fn mark_region_as_gpu_modified(&mut self, addr: DeviceAddr, size: u64);

    fn unmark_region_as_gpu_modified(&mut self, addr: DeviceAddr, size: u64);

    fn mark_region_as_preflushable(&mut self, addr: DeviceAddr, size: u64);

    /// Record a CPU write whose dirty marking is deferred until [`Self::flush_cached_writes`].
    fn cached_cpu_write(&mut self, addr: DeviceAddr, size: u64);

    /// Promote deferred writes inside the range to CPU modifications.
    fn flush_cached_writes(&mut self, addr: DeviceAddr, size: u64);

    /// Calls `func(addr, size)` for every CPU-modified sub-range and marks it clean.
    fn for_each_upload_range(
        &mut self,
        addr: DeviceAddr,
        size: u64,
        func: &mut dyn FnMut(DeviceAddr, u64),
    );

    /// Calls `func(addr, size)` for every GPU-modified sub-range, clearing it when `clear` is set.
    fn for_each_download_range(
        &mut self,
        addr: DeviceAddr,
        size: u64,
        clear: bool,
        func: &mut dyn FnMut(DeviceAddr, u64),
    );
}

/// Byte-granular [`MemoryTracker`] built on interval sets.
#[derive(Debug, Default, Clone)]
pub struct RangeMemoryTracker {
    /// Bytes whose host copy matches guest memory (or is newer).
    cpu_clean: RangeSet,
    gpu_modified: RangeSet,
    preflushable: RangeSet,
    cached_writes: RangeSet,
}

impl RangeMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_cached_writes(&self) -> bool {
        !self.cached_writes.is_empty()
    }
}

impl MemoryTracker for RangeMemoryTracker {
    fn is_region_cpu_modified(&self, addr: DeviceAddr, size: u64) -> bool {
        size != 0 && !self.cpu_clean.covers(addr, size)
    }

    fn is_region_gpu_modified(&self, addr: DeviceAddr, size: u64) -> bool {
        self.gpu_modified.intersects(addr, size)
    }

    fn is_region_preflushable(&self, addr: DeviceAddr, size: u64) -> bool {
        self.preflushable.intersects(addr, size)
    }

    fn mark_region_as_cpu_modified(&mut self, addr: DeviceAddr, size: u64) {
        self.cpu_clean.subtract(addr, size);
        self.gpu_modified.subtract(addr, size);
        self.preflushable.subtract(addr, size);
        self.cached_writes.subtract(addr, size);
    }

    fn mark_region_as_gpu_modified(&mut self, addr: DeviceAddr, size: u64) {
        self.gpu_modified.add(addr, size);
        self.cpu_clean.add(addr, size);
        // Earlier deferred CPU writes to these bytes are superseded.
        self.cached_writes.subtract(addr, size);
    }

    fn unmark_region_as_gpu_modified(&mut self, addr: DeviceAddr, size: u64) {
        self.gpu_modified.subtract(addr, size);
        self.preflushable.subtract(addr, size);
    }

    fn mark_region_as_preflushable(&mut self, addr: DeviceAddr, size: u64) {
        self.preflushable.add(addr, size);
    }

    fn cached_cpu_write(&mut self, addr: DeviceAddr, size: u64) {
        self.cached_writes.add(addr, size);
    }

    fn flush_cached_writes(&mut self, addr: DeviceAddr, size: u64) {
        let mut pending = Vec::new();
        self.cached_writes
            .for_each_in_range(addr, size, |start, end| pending.push((start, end)));
        for (start, end) in pending {
            self.mark_region_as_cpu_modified(start, end - start);
        }
    }

    fn for_each_upload_range(
        &mut self,
        addr: DeviceAddr,
        size: u64,
        func: &mut dyn FnMut(DeviceAddr, u64),
    ) {
        let mut dirty = Vec::new();
        self.cpu_clean
            .for_each_gap(addr, size, |start, end| dirty.push((start, end)));
        for (start, end) in dirty {
            func(start, end - start);
            self.cpu_clean.add(start, end - start);
        }
    }

    fn for_each_download_range(
        &mut self,
        addr: DeviceAddr,
        size: u64,
        clear: bool,
        func: &mut dyn FnMut(DeviceAddr, u64),
    ) {
        let mut modified = Vec::new();
        self.gpu_modified
            .for_each_in_range(addr, size, |start, end| modified.push((start, end)));
        for (start, end) in modified {
            func(start, end - start);
            if clear {
                self.unmark_region_as_gpu_modified(start, end - start);
            }
        }
    }
}
