// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use aero_buffer_cache::addr::DEVICE_PAGE_SIZE;
use aero_buffer_cache::{
    BufferCache, BufferCacheConfig, BufferRuntime, DeviceAddr, DeviceMemory, ObtainBufferOperation,
    ObtainBufferSynchronize, PagedGpuMemory, RuntimeCapabilities, SoftBufferRuntime,
    VecDeviceMemory,
};

pub type TestCache = BufferCache<SoftBufferRuntime, VecDeviceMemory, PagedGpuMemory>;

pub const GUEST_MEMORY_SIZE: u64 = 0x100_0000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Cache over 16 MiB of guest memory, identity mapped into the GPU address space except for the
/// first page so that GPU address 0 stays unmapped.
pub fn cache_with(config: BufferCacheConfig, capabilities: RuntimeCapabilities) -> TestCache {
    init_tracing();
    let mut gpu_memory = PagedGpuMemory::new();
    gpu_memory.map_identity(DEVICE_PAGE_SIZE, GUEST_MEMORY_SIZE - DEVICE_PAGE_SIZE);
    BufferCache::new(
        config,
        SoftBufferRuntime::with_capabilities(capabilities),
        VecDeviceMemory::new(GUEST_MEMORY_SIZE as usize),
        gpu_memory,
    )
    .expect("test config is valid")
}

pub fn cache() -> TestCache {
    cache_with(BufferCacheConfig::default(), RuntimeCapabilities::default())
}

/// 4 KiB caching pages, so small requests produce small buffers.
pub fn small_pages() -> BufferCacheConfig {
    BufferCacheConfig {
        caching_page_bits: 12,
        ..Default::default()
    }
}

/// CPU store: write guest memory and notify the cache.
pub fn guest_write(cache: &mut TestCache, addr: DeviceAddr, data: &[u8]) {
    cache.memory_mut().write_block(addr, data);
    cache.write_memory(addr, data.len() as u64);
}

pub fn guest_read(cache: &TestCache, addr: DeviceAddr, len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    cache.memory().read_block(addr, &mut data);
    data
}

/// Host copy of `[addr, addr + len)` in the buffer owning `addr`.
pub fn host_read(cache: &TestCache, addr: DeviceAddr, len: usize) -> Vec<u8> {
    let id = cache.buffer_at(addr).expect("address is cached");
    let buffer = cache.buffer(id).expect("live buffer");
    let offset = buffer.offset(addr) as usize;
    let contents = cache
        .runtime()
        .buffer_contents(buffer.host())
        .expect("host buffer exists");
    contents[offset..offset + len].to_vec()
}

/// GPU store: write the host buffer directly and record the range as GPU-modified.
pub fn gpu_write(cache: &mut TestCache, addr: DeviceAddr, data: &[u8]) {
    let obtained = cache.obtain_cpu_buffer(
        addr,
        data.len() as u64,
        ObtainBufferSynchronize::FullSynchronize,
        ObtainBufferOperation::MarkAsWritten,
    );
    cache
        .runtime_mut()
        .immediate_upload(obtained.host, obtained.offset, data);
}

/// Deterministic pseudo-random bytes; distinct seeds give unrelated contents.
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed;
    std::iter::repeat_with(|| {
        // splitmix64
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    })
    .flat_map(u64::to_le_bytes)
    .take(len)
    .collect()
}
