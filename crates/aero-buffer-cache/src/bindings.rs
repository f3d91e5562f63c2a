//! Shader-visible binding slots and the per-draw state that feeds them.

use crate::addr::{DeviceAddr, GpuAddr};
use crate::buffer::{BufferId, NULL_BUFFER_ID};
use crate::runtime::IndexFormat;

pub const NUM_VERTEX_BUFFERS: usize = 32;
pub const NUM_TRANSFORM_FEEDBACK_BUFFERS: usize = 4;
pub const NUM_GRAPHICS_UNIFORM_BUFFERS: usize = 18;
pub const NUM_COMPUTE_UNIFORM_BUFFERS: usize = 8;
pub const NUM_STORAGE_BUFFERS: usize = 16;
pub const NUM_TEXTURE_BUFFERS: usize = 32;
/// Graphics pipeline stages.
pub const NUM_STAGES: usize = 5;

/// Graphics stages plus compute, which owns its own set of slots.
pub(crate) const NUM_SLOT_SETS: usize = NUM_STAGES + 1;

/// Size cap for storage buffers whose descriptor does not carry a size.
pub(crate) const MAX_STORAGE_BUFFER_SIZE: u64 = 8 * 1024 * 1024;

/// Vertex streams at least this large are clipped to their contiguous mapping.
pub(crate) const LARGE_VERTEX_BUFFER_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEval,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const GRAPHICS: [ShaderStage; NUM_STAGES] = [
        ShaderStage::Vertex,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_compute(self) -> bool {
        matches!(self, ShaderStage::Compute)
    }

    pub const fn max_uniform_buffers(self) -> usize {
        if self.is_compute() {
            NUM_COMPUTE_UNIFORM_BUFFERS
        } else {
            NUM_GRAPHICS_UNIFORM_BUFFERS
        }
    }
}

/// Guest pixel format of a texture buffer, passed through to the runtime untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const INVALID: PixelFormat = PixelFormat(0);
}

/// Resolution of one shader-visible slot to a guest range and the buffer backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub device_addr: DeviceAddr,
    pub size: u64,
    /// `None` until the next update pass resolves the range to a buffer.
    pub buffer_id: Option<BufferId>,
}

/// The "unbound" binding.
pub const NULL_BINDING: Binding = Binding {
    device_addr: 0,
    size: 0,
    buffer_id: Some(NULL_BUFFER_ID),
};

impl Binding {
    pub const fn unresolved(device_addr: DeviceAddr, size: u64) -> Self {
        Self {
            device_addr,
            size,
            buffer_id: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.buffer_id == Some(NULL_BUFFER_ID)
    }
}

impl Default for Binding {
    fn default() -> Self {
        NULL_BINDING
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureBufferBinding {
    pub binding: Binding,
    pub format: PixelFormat,
}

impl TextureBufferBinding {
    pub const NULL: TextureBufferBinding = TextureBufferBinding {
        binding: NULL_BINDING,
        format: PixelFormat::INVALID,
    };
}

/// Index buffer registers as latched by the 3D engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferState {
    pub gpu_addr_start: GpuAddr,
    /// Exclusive end of the mapped index range.
    pub gpu_addr_end: GpuAddr,
    pub format: IndexFormat,
    pub first: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexStreamState {
    pub enabled: bool,
    pub gpu_addr_start: GpuAddr,
    /// Exclusive end of the stream, from the stream limit register.
    pub gpu_addr_end: GpuAddr,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformFeedbackBufferState {
    pub enabled: bool,
    /// Buffer address with the start offset already applied.
    pub gpu_addr: GpuAddr,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndirectParams {
    pub indirect_start_address: GpuAddr,
    pub buffer_size: u64,
    /// Draw count comes from a separate buffer when set.
    pub include_count: bool,
    pub count_start_address: GpuAddr,
}

/// Every binding slot of one GPU channel.
///
/// Compute slots live at index [`NUM_STAGES`] of the per-stage arrays.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub index_buffer: Binding,
    pub index_state: Option<IndexBufferState>,

    pub vertex_streams: [VertexStreamState; NUM_VERTEX_BUFFERS],
    pub vertex_buffers: [Binding; NUM_VERTEX_BUFFERS],

    pub transform_feedback_enabled: bool,
    pub transform_feedback_states: [TransformFeedbackBufferState; NUM_TRANSFORM_FEEDBACK_BUFFERS],
    pub transform_feedback_buffers: [Binding; NUM_TRANSFORM_FEEDBACK_BUFFERS],

    pub draw_indirect: Option<DrawIndirectParams>,
    pub indirect_buffer: Binding,
    pub count_buffer: Binding,

    pub uniform_buffers: [[Binding; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_SLOT_SETS],
    pub enabled_uniform_buffer_masks: [u32; NUM_SLOT_SETS],
    /// Sizes declared by the bound shaders; a binding is clipped to them when bound.
    pub uniform_buffer_sizes: [[u32; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_SLOT_SETS],

    pub storage_buffers: [[Binding; NUM_STORAGE_BUFFERS]; NUM_SLOT_SETS],
    pub enabled_storage_buffers: [u32; NUM_SLOT_SETS],
    pub written_storage_buffers: [u32; NUM_SLOT_SETS],

    pub texture_buffers: [[TextureBufferBinding; NUM_TEXTURE_BUFFERS]; NUM_SLOT_SETS],
    pub enabled_texture_buffers: [u32; NUM_SLOT_SETS],
    pub written_texture_buffers: [u32; NUM_SLOT_SETS],
    pub image_texture_buffers: [u32; NUM_SLOT_SETS],

    /// Cached-path uniform synchronizations that found nothing to upload, per frame.
    pub uniform_cache_hits: [u32; 16],
    /// Cached-path uniform synchronizations, per frame.
    pub uniform_cache_shots: [u32; 16],
    pub uniform_buffer_skip_cache_size: u32,

    /// Set whenever a buffer is destroyed; update passes repeat until it stays clear.
    pub has_deleted_buffers: bool,
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            index_buffer: NULL_BINDING,
            index_state: None,
            vertex_streams: [VertexStreamState::default(); NUM_VERTEX_BUFFERS],
            vertex_buffers: [NULL_BINDING; NUM_VERTEX_BUFFERS],
            transform_feedback_enabled: false,
            transform_feedback_states: [TransformFeedbackBufferState::default();
                NUM_TRANSFORM_FEEDBACK_BUFFERS],
            transform_feedback_buffers: [NULL_BINDING; NUM_TRANSFORM_FEEDBACK_BUFFERS],
            draw_indirect: None,
            indirect_buffer: NULL_BINDING,
            count_buffer: NULL_BINDING,
            uniform_buffers: [[NULL_BINDING; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_SLOT_SETS],
            enabled_uniform_buffer_masks: [0; NUM_SLOT_SETS],
            uniform_buffer_sizes: [[0; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_SLOT_SETS],
            storage_buffers: [[NULL_BINDING; NUM_STORAGE_BUFFERS]; NUM_SLOT_SETS],
            enabled_storage_buffers: [0; NUM_SLOT_SETS],
            written_storage_buffers: [0; NUM_SLOT_SETS],
            texture_buffers: [[TextureBufferBinding::NULL; NUM_TEXTURE_BUFFERS]; NUM_SLOT_SETS],
            enabled_texture_buffers: [0; NUM_SLOT_SETS],
            written_texture_buffers: [0; NUM_SLOT_SETS],
            image_texture_buffers: [0; NUM_SLOT_SETS],
            uniform_cache_hits: [0; 16],
            uniform_cache_shots: [0; 16],
            uniform_buffer_skip_cache_size: 0,
            has_deleted_buffers: false,
        }
    }

    /// Every binding in the channel, for invalidation after a buffer is destroyed.
    pub fn bindings_mut(&mut self) -> impl Iterator<Item = &mut Binding> + '_ {
        core::iter::once(&mut self.index_buffer)
            .chain(self.vertex_buffers.iter_mut())
            .chain(self.transform_feedback_buffers.iter_mut())
            .chain(core::iter::once(&mut self.indirect_buffer))
            .chain(core::iter::once(&mut self.count_buffer))
            .chain(self.uniform_buffers.iter_mut().flatten())
            .chain(self.storage_buffers.iter_mut().flatten())
            .chain(
                self.texture_buffers
                    .iter_mut()
                    .flatten()
                    .map(|texture| &mut texture.binding),
            )
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> + '_ {
        core::iter::once(&self.index_buffer)
            .chain(self.vertex_buffers.iter())
            .chain(self.transform_feedback_buffers.iter())
            .chain(core::iter::once(&self.indirect_buffer))
            .chain(core::iter::once(&self.count_buffer))
            .chain(self.uniform_buffers.iter().flatten())
            .chain(self.storage_buffers.iter().flatten())
            .chain(
                self.texture_buffers
                    .iter()
                    .flatten()
                    .map(|texture| &texture.binding),
            )
    }

    /// Shift the hit/shot windows by one frame and return the sums of the frame that ended.
    pub fn rotate_uniform_counters(&mut self) -> (u32, u32) {
        let hits = self.uniform_cache_hits.iter().sum();
        let shots = self.uniform_cache_shots.iter().sum();
        self.uniform_cache_hits.rotate_right(1);
        self.uniform_cache_shots.rotate_right(1);
        self.uniform_cache_hits[0] = 0;
        self.uniform_cache_shots[0] = 0;
        (hits, shots)
    }
}

/// Iterate the indices of set bits, lowest first.
pub(crate) fn enabled_bits(mut mask: u32) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let index = mask.trailing_zeros();
        mask &= mask - 1;
        Some(index as usize)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_bits_yields_set_indices() {
        assert_eq!(enabled_bits(0).count(), 0);
        assert_eq!(
            enabled_bits(0b1000_0000_0000_0000_0000_0000_0010_0101).collect::<Vec<_>>(),
            vec![0, 2, 5, 31]
        );
    }

    #[test]
    fn fresh_channel_is_fully_unbound() {
        let channel = ChannelState::new();
        assert!(channel.bindings().all(Binding::is_null));
        assert_eq!(
            channel.bindings().count(),
            1 + NUM_VERTEX_BUFFERS
                + NUM_TRANSFORM_FEEDBACK_BUFFERS
                + 2
                + NUM_SLOT_SETS
                    * (NUM_GRAPHICS_UNIFORM_BUFFERS + NUM_STORAGE_BUFFERS + NUM_TEXTURE_BUFFERS)
        );
    }

    #[test]
    fn uniform_counters_slide_by_one_frame() {
        let mut channel = ChannelState::new();
        channel.uniform_cache_hits[0] = 3;
        channel.uniform_cache_shots[0] = 4;
        assert_eq!(channel.rotate_uniform_counters(), (3, 4));
        assert_eq!(channel.uniform_cache_hits[1], 3);
        assert_eq!(channel.uniform_cache_hits[0], 0);

        channel.uniform_cache_shots[15] = 100;
        channel.rotate_uniform_counters();
        // The oldest sample falls off the end of the window.
        assert_eq!(channel.uniform_cache_shots.iter().sum::<u32>(), 4);
    }
}
