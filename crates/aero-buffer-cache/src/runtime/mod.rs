//! Host graphics backend boundary.

mod soft;

pub use soft::{BindRecord, SoftBufferRuntime, TransferRecord};

use crate::bindings::{PixelFormat, ShaderStage};

/// Opaque handle to a host buffer object owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostBuffer(pub u64);

/// A host-visible transfer allocation: `size` bytes at `offset` inside `buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingBuffer {
    pub buffer: HostBuffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

impl IndexFormat {
    pub const fn size_in_bytes(self) -> u64 {
        match self {
            IndexFormat::U8 => 1,
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Backend properties that select between transfer strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// Uploads go through one mapped staging allocation and a buffer copy.
    pub use_memory_maps_for_uploads: bool,
    /// Downloads go through mapped staging; required for asynchronous flushes.
    pub use_memory_maps: bool,
    /// Device-local memory, when the backend can report it.
    pub device_local_memory: Option<u64>,
    pub storage_buffer_alignment: u64,
}

impl Default for RuntimeCapabilities {
    fn default() -> Self {
        Self {
            use_memory_maps_for_uploads: true,
            use_memory_maps: true,
            device_local_memory: None,
            storage_buffer_alignment: 16,
        }
    }
}

/// Host buffer allocation, transfer and binding.
///
/// Staging exhaustion is not reported: implementations grow their pools or abort, since retrying
/// mid-frame cannot change host memory occupancy.
pub trait BufferRuntime {
    fn capabilities(&self) -> RuntimeCapabilities;

    /// Create a buffer of `size` bytes. Contents are undefined until cleared or written.
    fn create_buffer(&mut self, size: u64) -> HostBuffer;

    fn destroy_buffer(&mut self, buffer: HostBuffer);

    /// Record `copies` from `src` into `dst`. `barrier` requests the transfer barriers around the
    /// copy; callers batching several copies pass `false` and issue
    /// [`Self::pre_copy_barrier`]/[`Self::post_copy_barrier`] themselves.
    fn copy_buffer(
        &mut self,
        dst: HostBuffer,
        src: HostBuffer,
        copies: &[BufferCopy],
        barrier: bool,
    );

    /// Fill `size` bytes at `offset` with the little-endian word `value`.
    fn clear_buffer(&mut self, buffer: HostBuffer, offset: u64, size: u64, value: u32);

    fn immediate_upload(&mut self, buffer: HostBuffer, offset: u64, data: &[u8]);

    fn immediate_download(&mut self, buffer: HostBuffer, offset: u64, dst: &mut [u8]);

    /// Allocation released automatically once the runtime ticks past the current frame.
    fn upload_staging_buffer(&mut self, size: u64) -> StagingBuffer;

    /// `deferred` allocations stay alive until [`Self::free_deferred_staging_buffer`].
    fn download_staging_buffer(&mut self, size: u64, deferred: bool) -> StagingBuffer;

    fn free_deferred_staging_buffer(&mut self, staging: StagingBuffer);

    /// CPU view of a staging allocation, exactly `staging.size` bytes long.
    fn mapped_span(&mut self, staging: &StagingBuffer) -> &mut [u8];

    fn pre_copy_barrier(&mut self);

    fn post_copy_barrier(&mut self);

    /// Block until all recorded work has executed.
    fn finish(&mut self);

    fn tick_frame(&mut self);

    /// Current device memory usage, meaningful when
    /// [`RuntimeCapabilities::device_local_memory`] is reported.
    fn device_memory_usage(&self) -> u64;

    fn bind_index_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: IndexFormat,
    );

    fn bind_vertex_buffer(
        &mut self,
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        stride: u32,
    );

    fn bind_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    );

    /// Bind a per-draw uniform window of `size` bytes and return it for the caller to fill.
    fn bind_mapped_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        size: u64,
    ) -> &mut [u8];

    fn bind_storage_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        is_written: bool,
    );

    fn bind_texture_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    );

    fn bind_image_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    );

    fn bind_transform_feedback_buffer(
        &mut self,
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    );
}
