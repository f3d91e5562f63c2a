use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for the buffer cache.
///
/// Updated on the render thread; safe to read from another thread.
#[derive(Debug, Default)]
pub struct BufferCacheStats {
    buffers_created: AtomicU64,
    buffers_joined: AtomicU64,
    buffers_evicted: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    uniform_fast_binds: AtomicU64,
    async_commits: AtomicU64,
    async_pops: AtomicU64,
    dma_copies: AtomicU64,
    dma_clears: AtomicU64,
}

impl BufferCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_buffers_created(&self) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_buffers_joined(&self) {
        self.buffers_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_buffers_evicted(&self) {
        self.buffers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn inc_uniform_fast_binds(&self) {
        self.uniform_fast_binds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_async_commits(&self) {
        self.async_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_async_pops(&self) {
        self.async_pops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_dma_copies(&self) {
        self.dma_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_dma_clears(&self) {
        self.dma_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BufferCacheStatsSnapshot {
        BufferCacheStatsSnapshot {
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
            buffers_joined: self.buffers_joined.load(Ordering::Relaxed),
            buffers_evicted: self.buffers_evicted.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            uniform_fast_binds: self.uniform_fast_binds.load(Ordering::Relaxed),
            async_commits: self.async_commits.load(Ordering::Relaxed),
            async_pops: self.async_pops.load(Ordering::Relaxed),
            dma_copies: self.dma_copies.load(Ordering::Relaxed),
            dma_clears: self.dma_clears.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCacheStatsSnapshot {
    pub buffers_created: u64,
    pub buffers_joined: u64,
    pub buffers_evicted: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub uniform_fast_binds: u64,
    pub async_commits: u64,
    pub async_pops: u64,
    pub dma_copies: u64,
    pub dma_clears: u64,
}

impl BufferCacheStatsSnapshot {
    pub fn to_json(self) -> String {
        format!(
            concat!(
                "{{",
                "\"buffers_created\":{},\"buffers_joined\":{},\"buffers_evicted\":{},",
                "\"bytes_uploaded\":{},\"bytes_downloaded\":{},\"uniform_fast_binds\":{},",
                "\"async_commits\":{},\"async_pops\":{},",
                "\"dma_copies\":{},\"dma_clears\":{}",
                "}}",
            ),
            self.buffers_created,
            self.buffers_joined,
            self.buffers_evicted,
            self.bytes_uploaded,
            self.bytes_downloaded,
            self.uniform_fast_binds,
            self.async_commits,
            self.async_pops,
            self.dma_copies,
            self.dma_clears,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = BufferCacheStats::new();
        stats.inc_buffers_created();
        stats.inc_buffers_created();
        stats.add_bytes_uploaded(256);
        stats.inc_async_commits();

        let json = stats.to_json();
        assert!(json.contains("\"buffers_created\":2"));
        assert!(json.contains("\"bytes_uploaded\":256"));
        assert!(json.contains("\"async_commits\":1"));
        assert!(json.contains("\"async_pops\":0"));
    }
}
