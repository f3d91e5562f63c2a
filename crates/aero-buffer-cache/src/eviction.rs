//! LRU bookkeeping, memory watermarks and deferred destruction.

use lru::LruCache;

use crate::buffer::BufferId;
use crate::config::BufferCacheConfig;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Upper bound of the device memory that scales the vacancy margins.
const TARGET_THRESHOLD: u64 = 4 * GIB;

/// Least-recently-used registry of live buffers, valued by the frame tick of last use.
#[derive(Debug)]
pub(crate) struct BufferLru {
    entries: LruCache<BufferId, u64>,
}

impl BufferLru {
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }

    pub fn insert(&mut self, id: BufferId, tick: u64) {
        let old = self.entries.put(id, tick);
        debug_assert!(old.is_none(), "{id:?} registered twice in the LRU");
    }

    pub fn touch(&mut self, id: BufferId, tick: u64) {
        if let Some(last_used) = self.entries.get_mut(&id) {
            *last_used = tick;
        }
    }

    pub fn remove(&mut self, id: BufferId) {
        self.entries.pop(&id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Up to `max` buffers last used before `tick`, least recently used first.
    pub fn stale(&self, tick: u64, max: usize) -> Vec<BufferId> {
        self.entries
            .iter()
            .rev()
            .take_while(|&(_, &last_used)| last_used < tick)
            .take(max)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Host-memory watermarks that drive garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Collection runs once usage reaches this.
    pub minimum_memory: u64,
    /// Aggressive collection runs once usage reaches this.
    pub critical_memory: u64,
}

impl MemoryBudget {
    /// Derive watermarks from the device-local memory reported by the runtime, falling back to the
    /// configured defaults when the runtime cannot report it.
    pub fn new(config: &BufferCacheConfig, device_local_memory: Option<u64>) -> Self {
        let Some(local) = device_local_memory else {
            return Self {
                minimum_memory: config.expected_memory,
                critical_memory: config.critical_memory,
            };
        };
        let threshold = local.min(TARGET_THRESHOLD);
        let vacancy_expected = threshold * 6 / 10;
        let vacancy_critical = threshold * 2 / 10;
        let minimum_memory = local
            .saturating_sub(vacancy_expected)
            .min(local.saturating_sub(GIB))
            .max(config.expected_memory);
        let critical_memory = local
            .saturating_sub(vacancy_critical)
            .min(local.saturating_sub(512 * MIB))
            .max(config.critical_memory);
        Self {
            minimum_memory,
            critical_memory,
        }
    }
}

/// Fixed-depth ring that hands values back `depth` ticks after they were pushed.
#[derive(Debug)]
pub(crate) struct DelayedDestructionRing<T> {
    index: usize,
    elements: Vec<Vec<T>>,
}

impl<T> DelayedDestructionRing<T> {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            index: 0,
            elements: (0..depth).map(|_| Vec::new()).collect(),
        }
    }

    pub fn push(&mut self, value: T) {
        self.elements[self.index].push(value);
    }

    /// Advance one frame, returning the values whose delay expired.
    pub fn tick(&mut self) -> Vec<T> {
        self.index = (self.index + 1) % self.elements.len();
        std::mem::take(&mut self.elements[self.index])
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.elements.iter_mut().flat_map(std::mem::take).collect()
    }
}
