mod common;

use aero_buffer_cache::{
    BindRecord, BufferRuntime, DeviceMemory, HostBuffer, RuntimeCapabilities, ShaderStage,
};
use common::{cache, cache_with, guest_read, host_read, pattern, TestCache};
use pretty_assertions::assert_eq;

const DESCRIPTOR: u64 = 0x3_0000;
const OUTPUT: u64 = 0x5_0000;

/// Dispatch a compute shader writing `data` to a storage buffer at `OUTPUT`.
fn dispatch_writing(cache: &mut TestCache, data: &[u8]) {
    cache.memory_mut().write_obj(DESCRIPTOR, &OUTPUT);
    cache
        .memory_mut()
        .write_obj(DESCRIPTOR + 8, &(data.len() as u32));
    cache
        .bind_storage_buffer(ShaderStage::Compute, 0, 0, DESCRIPTOR, true)
        .unwrap();
    cache.update_compute_buffers();
    cache.runtime_mut().clear_logs();
    cache.bind_host_compute_buffers();

    let (buffer, offset) = storage_bind(cache);
    cache.runtime_mut().immediate_upload(buffer, offset, data);
}

fn storage_bind(cache: &TestCache) -> (HostBuffer, u64) {
    cache
        .runtime()
        .binds()
        .iter()
        .find_map(|bind| match *bind {
            BindRecord::Storage {
                buffer,
                offset,
                is_written: true,
                ..
            } => Some((buffer, offset)),
            _ => None,
        })
        .expect("written storage buffer was bound")
}

#[test]
fn storage_results_reach_the_guest_after_the_fence() {
    let mut cache = cache();
    let data = pattern(20, 0x100);
    dispatch_writing(&mut cache, &data);
    assert!(cache.is_region_gpu_modified(OUTPUT, 0x100));

    cache.commit_async_flushes();
    assert_eq!(guest_read(&cache, OUTPUT, 0x100), vec![0; 0x100]);
    cache.pop_async_flushes();
    assert_eq!(guest_read(&cache, OUTPUT, 0x100), data);
    assert!(!cache.is_region_gpu_modified(OUTPUT, 0x100));
    assert_eq!(cache.stats().snapshot().async_commits, 1);
}

#[test]
fn runtimes_without_mapped_memory_flush_on_commit() {
    let capabilities = RuntimeCapabilities {
        use_memory_maps: false,
        use_memory_maps_for_uploads: false,
        ..Default::default()
    };
    let mut cache = cache_with(Default::default(), capabilities);
    let data = pattern(21, 0x40);
    dispatch_writing(&mut cache, &data);

    cache.commit_async_flushes();
    assert_eq!(guest_read(&cache, OUTPUT, 0x40), data);
    cache.pop_async_flushes();
    assert_eq!(guest_read(&cache, OUTPUT, 0x40), data);
}

#[test]
fn inline_writes_replace_gpu_results() {
    let mut cache = cache();
    dispatch_writing(&mut cache, &pattern(22, 0x100));

    assert!(cache.inline_memory(OUTPUT + 0x10, &[9; 0x10]));
    assert_eq!(guest_read(&cache, OUTPUT + 0x10, 0x10), vec![9; 0x10]);
    assert_eq!(host_read(&cache, OUTPUT + 0x10, 0x10), vec![9; 0x10]);
    assert!(!cache.is_region_gpu_modified(OUTPUT + 0x10, 0x10));

    // Outside the cache nothing is consumed.
    assert!(!cache.inline_memory(0xc0_0000, &[1; 4]));
}

#[test]
fn dma_copies_carry_compute_results() {
    let mut cache = cache();
    let data = pattern(23, 0x100);
    dispatch_writing(&mut cache, &data);

    assert!(cache.dma_copy(OUTPUT, 0x6_0000, 0x100));
    assert!(cache.is_region_gpu_modified(0x6_0000, 0x100));
    assert_eq!(host_read(&cache, 0x6_0000, 0x100), data);

    cache.download_memory(0x6_0000, 0x100);
    assert_eq!(guest_read(&cache, 0x6_0000, 0x100), data);
}
