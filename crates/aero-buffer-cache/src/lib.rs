//! Host-side cache of guest GPU buffers.
//!
//! Guest shaders and fixed-function engines address buffers through GPU virtual addresses that
//! alias guest main memory, which the emulated CPU can write at any time. This crate mirrors the
//! ranges the GPU uses into host buffer objects and keeps both sides coherent:
//!
//! - [`BufferCache`]: owns the buffers, merges overlapping requests, uploads CPU writes, downloads
//!   GPU writes (synchronously or through an asynchronous flush pipeline) and evicts stale buffers.
//! - [`BufferRuntime`]: the host graphics backend boundary; [`SoftBufferRuntime`] executes it on
//!   the CPU.
//! - [`MemoryTracker`]: per-range CPU/GPU modification state ([`RangeMemoryTracker`]).
//! - [`DeviceMemory`]/[`GpuMemory`]: guest memory access and GPU address translation.
//!
//! The cache is single-threaded: every mutating call takes `&mut self`.

#![forbid(unsafe_code)]

mod buffer;
mod cache;
mod config;
mod error;
mod eviction;
mod page_table;
mod range_set;
mod slot;
mod tracker;

pub mod addr;
pub mod bindings;
pub mod memory;
pub mod runtime;
pub mod stats;

pub use addr::{DeviceAddr, GpuAddr};
pub use bindings::{
    Binding, DrawIndirectParams, IndexBufferState, PixelFormat, ShaderStage, TextureBufferBinding,
    TransformFeedbackBufferState, VertexStreamState, NULL_BINDING,
};
pub use buffer::{Buffer, BufferFlags, BufferId, NULL_BUFFER_ID};
pub use cache::{
    BufferCache, DownloadArea, ObtainBufferOperation, ObtainBufferSynchronize, ObtainedBuffer,
};
pub use config::{BufferCacheConfig, GcPolicy};
pub use error::{BufferCacheError, SlotKind};
pub use eviction::MemoryBudget;
pub use memory::{DeviceMemory, GpuMemory, PagedGpuMemory, VecDeviceMemory};
pub use range_set::{OverlapRangeSet, RangeSet};
pub use runtime::{
    BindRecord, BufferCopy, BufferRuntime, HostBuffer, IndexFormat, RuntimeCapabilities,
    SoftBufferRuntime, StagingBuffer, TransferRecord,
};
pub use slot::{SlotId, SlotVector};
pub use stats::{BufferCacheStats, BufferCacheStatsSnapshot};
pub use tracker::{MemoryTracker, RangeMemoryTracker};
