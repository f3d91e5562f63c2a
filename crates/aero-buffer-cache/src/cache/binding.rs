use tracing::warn;

use super::BufferCache;
use crate::addr::{align_down, align_up, DeviceAddr, GpuAddr};
use crate::bindings::{
    enabled_bits, Binding, DrawIndirectParams, IndexBufferState, PixelFormat, ShaderStage,
    TextureBufferBinding, TransformFeedbackBufferState, VertexStreamState, LARGE_VERTEX_BUFFER_SIZE,
    MAX_STORAGE_BUFFER_SIZE, NULL_BINDING, NUM_STORAGE_BUFFERS, NUM_TEXTURE_BUFFERS,
    NUM_TRANSFORM_FEEDBACK_BUFFERS, NUM_VERTEX_BUFFERS,
};
use crate::buffer::{BufferFlags, BufferId, NULL_BUFFER_ID};
use crate::error::{BufferCacheError, SlotKind};
use crate::memory::{DeviceMemory, GpuMemory};
use crate::runtime::{BufferRuntime, HostBuffer, IndexFormat};
use crate::tracker::MemoryTracker;

/// Granularity of the range forgotten by [`ObtainBufferOperation::DiscardWrite`].
const DISCARD_ALIGNMENT: u64 = 64;

/// Synchronization performed by [`BufferCache::obtain_buffer`] before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObtainBufferSynchronize {
    NoSynchronize,
    FullSynchronize,
    /// Upload CPU writes unless the host copy holds GPU results for the range.
    SynchronizeNoDirty,
}

/// What the caller is about to do with an obtained buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObtainBufferOperation {
    DoNothing,
    /// The GPU writes the range.
    MarkAsWritten,
    /// The range is about to be fully overwritten; pending GPU results are dropped.
    DiscardWrite,
    /// Query results land in the range and must reach the guest every frame.
    MarkQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObtainedBuffer {
    pub id: BufferId,
    pub host: HostBuffer,
    pub offset: u64,
}

fn check_slot(kind: SlotKind, index: usize, max: usize) -> Result<(), BufferCacheError> {
    if index < max {
        Ok(())
    } else {
        Err(BufferCacheError::SlotOutOfRange {
            kind,
            index: index as u32,
            max: max as u32,
        })
    }
}

fn is_bit_set(mask: u32, index: usize) -> bool {
    (mask >> index) & 1 != 0
}

impl<R, M, G, K> BufferCache<R, M, G, K>
where
    R: BufferRuntime,
    M: DeviceMemory,
    G: GpuMemory,
    K: MemoryTracker,
{
    /// Latch the index buffer registers; `None` for non-indexed draws.
    pub fn set_index_buffer(&mut self, state: Option<IndexBufferState>) {
        self.channel.index_state = state;
        self.channel.index_buffer = match state {
            Some(_) => Binding::unresolved(0, 0),
            None => NULL_BINDING,
        };
    }

    pub fn set_vertex_buffer(
        &mut self,
        index: usize,
        state: VertexStreamState,
    ) -> Result<(), BufferCacheError> {
        check_slot(SlotKind::Vertex, index, NUM_VERTEX_BUFFERS)?;
        self.channel.vertex_streams[index] = state;
        self.channel.vertex_buffers[index] = Binding::unresolved(0, 0);
        Ok(())
    }

    pub fn set_transform_feedback_enabled(&mut self, enabled: bool) {
        self.channel.transform_feedback_enabled = enabled;
    }

    pub fn set_transform_feedback(
        &mut self,
        index: usize,
        state: TransformFeedbackBufferState,
    ) -> Result<(), BufferCacheError> {
        check_slot(
            SlotKind::TransformFeedback,
            index,
            NUM_TRANSFORM_FEEDBACK_BUFFERS,
        )?;
        self.channel.transform_feedback_states[index] = state;
        self.channel.transform_feedback_buffers[index] = Binding::unresolved(0, 0);
        Ok(())
    }

    pub fn set_draw_indirect(&mut self, params: Option<DrawIndirectParams>) {
        self.channel.draw_indirect = params;
        self.channel.indirect_buffer = match params {
            Some(_) => Binding::unresolved(0, 0),
            None => NULL_BINDING,
        };
        self.channel.count_buffer = match params {
            Some(params) if params.include_count => Binding::unresolved(0, 0),
            _ => NULL_BINDING,
        };
    }

    /// Record which uniform slots the bound shader of `stage` reads and their declared sizes.
    ///
    /// A declared size of 0 binds the whole range given to [`Self::bind_uniform_buffer`].
    pub fn set_uniform_buffers_state(
        &mut self,
        stage: ShaderStage,
        mask: u32,
        sizes: &[u32],
    ) -> Result<(), BufferCacheError> {
        let max = stage.max_uniform_buffers();
        if let Some(index) = enabled_bits(mask).find(|&index| index >= max) {
            return Err(BufferCacheError::SlotOutOfRange {
                kind: SlotKind::Uniform,
                index: index as u32,
                max: max as u32,
            });
        }
        if sizes.len() > max {
            return Err(BufferCacheError::SlotOutOfRange {
                kind: SlotKind::Uniform,
                index: sizes.len() as u32 - 1,
                max: max as u32,
            });
        }
        let set = stage.index();
        self.channel.enabled_uniform_buffer_masks[set] = mask;
        let declared = &mut self.channel.uniform_buffer_sizes[set];
        declared.fill(0);
        declared[..sizes.len()].copy_from_slice(sizes);
        Ok(())
    }

    pub fn bind_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        index: usize,
        gpu_addr: GpuAddr,
        size: u64,
    ) -> Result<(), BufferCacheError> {
        check_slot(SlotKind::Uniform, index, stage.max_uniform_buffers())?;
        let binding = match self.gpu_memory.gpu_to_cpu_address(gpu_addr) {
            Some(device_addr) if size != 0 => Binding::unresolved(device_addr, size),
            _ => NULL_BINDING,
        };
        self.channel.uniform_buffers[stage.index()][index] = binding;
        Ok(())
    }

    pub fn disable_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        index: usize,
    ) -> Result<(), BufferCacheError> {
        check_slot(SlotKind::Uniform, index, stage.max_uniform_buffers())?;
        self.channel.uniform_buffers[stage.index()][index] = NULL_BINDING;
        Ok(())
    }

    /// Bind the storage buffer described at `descriptor_gpu_addr`.
    ///
    /// The descriptor holds the buffer's 64-bit GPU address; descriptors read from const buffer 0
    /// carry the size in the following word.
    pub fn bind_storage_buffer(
        &mut self,
        stage: ShaderStage,
        index: usize,
        cbuf_index: u32,
        descriptor_gpu_addr: GpuAddr,
        is_written: bool,
    ) -> Result<(), BufferCacheError> {
        check_slot(SlotKind::Storage, index, NUM_STORAGE_BUFFERS)?;
        let set = stage.index();
        self.channel.enabled_storage_buffers[set] |= 1 << index;
        if is_written {
            self.channel.written_storage_buffers[set] |= 1 << index;
        } else {
            self.channel.written_storage_buffers[set] &= !(1 << index);
        }
        self.channel.storage_buffers[set][index] =
            self.storage_buffer_binding(descriptor_gpu_addr, cbuf_index);
        Ok(())
    }

    fn storage_buffer_binding(&self, descriptor_gpu_addr: GpuAddr, cbuf_index: u32) -> Binding {
        let Some(descriptor) = self.gpu_memory.gpu_to_cpu_address(descriptor_gpu_addr) else {
            warn!(descriptor_gpu_addr, "storage buffer descriptor is not mapped");
            return NULL_BINDING;
        };
        let gpu_addr: u64 = self.memory.read_obj(descriptor);
        let declared_size = if cbuf_index == 0 {
            u64::from(self.memory.read_obj::<u32>(descriptor + 8))
        } else {
            0
        };
        let size = if declared_size != 0 {
            declared_size
        } else {
            self.gpu_memory
                .memory_layout_size(gpu_addr, MAX_STORAGE_BUFFER_SIZE)
        };

        let alignment = self.runtime.capabilities().storage_buffer_alignment.max(1);
        let aligned_gpu_addr = align_down(gpu_addr, alignment);
        let Some(device_addr) = self.gpu_memory.gpu_to_cpu_address(aligned_gpu_addr) else {
            warn!(gpu_addr, size, "failed to find storage buffer");
            return NULL_BINDING;
        };
        if size == 0 {
            warn!(gpu_addr, "storage buffer has no size");
            return NULL_BINDING;
        }
        Binding::unresolved(device_addr, size + (gpu_addr - aligned_gpu_addr))
    }

    pub fn unbind_storage_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        self.channel.enabled_storage_buffers[set] = 0;
        self.channel.written_storage_buffers[set] = 0;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind_texture_buffer(
        &mut self,
        stage: ShaderStage,
        index: usize,
        gpu_addr: GpuAddr,
        size: u64,
        format: PixelFormat,
        is_written: bool,
        is_image: bool,
    ) -> Result<(), BufferCacheError> {
        check_slot(SlotKind::Texture, index, NUM_TEXTURE_BUFFERS)?;
        let set = stage.index();
        let bit = 1u32 << index;
        self.channel.enabled_texture_buffers[set] |= bit;
        for (mask, value) in [
            (&mut self.channel.written_texture_buffers[set], is_written),
            (&mut self.channel.image_texture_buffers[set], is_image),
        ] {
            if value {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        }
        let binding = match self.gpu_memory.gpu_to_cpu_address(gpu_addr) {
            Some(device_addr) if size != 0 => Binding::unresolved(device_addr, size),
            _ => NULL_BINDING,
        };
        self.channel.texture_buffers[set][index] = TextureBufferBinding { binding, format };
        Ok(())
    }

    pub fn unbind_texture_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        self.channel.enabled_texture_buffers[set] = 0;
        self.channel.written_texture_buffers[set] = 0;
        self.channel.image_texture_buffers[set] = 0;
    }

    /// Resolve every graphics binding to a buffer ahead of a draw.
    pub fn update_graphics_buffers(&mut self, is_indexed: bool) {
        loop {
            self.channel.has_deleted_buffers = false;
            if is_indexed {
                self.update_index_buffer();
            }
            self.update_vertex_buffers();
            self.update_transform_feedback_buffers();
            for stage in ShaderStage::GRAPHICS {
                self.update_stage_buffers(stage);
            }
            self.update_draw_indirect();
            // Creating a buffer may have destroyed one resolved earlier in the pass.
            if !self.channel.has_deleted_buffers {
                break;
            }
        }
    }

    pub fn update_compute_buffers(&mut self) {
        loop {
            self.channel.has_deleted_buffers = false;
            self.update_stage_buffers(ShaderStage::Compute);
            if !self.channel.has_deleted_buffers {
                break;
            }
        }
    }

    fn update_index_buffer(&mut self) {
        if self.channel.index_buffer.buffer_id.is_some() {
            return;
        }
        let Some(state) = self.channel.index_state else {
            self.channel.index_buffer = NULL_BINDING;
            return;
        };
        let address_size = state.gpu_addr_end.saturating_sub(state.gpu_addr_start);
        let draw_size =
            (u64::from(state.first) + u64::from(state.count)) * state.format.size_in_bytes();
        let size = address_size.min(draw_size);
        let device_addr = self.gpu_memory.gpu_to_cpu_address(state.gpu_addr_start);
        self.channel.index_buffer = match device_addr {
            Some(device_addr) if size != 0 => self.resolve(device_addr, size),
            _ => NULL_BINDING,
        };
    }

    fn update_vertex_buffers(&mut self) {
        for index in 0..NUM_VERTEX_BUFFERS {
            if self.channel.vertex_buffers[index].buffer_id.is_some() {
                continue;
            }
            let stream = self.channel.vertex_streams[index];
            let mut size = stream.gpu_addr_end.saturating_sub(stream.gpu_addr_start);
            let device_addr = self.gpu_memory.gpu_to_cpu_address(stream.gpu_addr_start);
            let binding = match device_addr {
                Some(device_addr) if stream.enabled && size != 0 => {
                    if size >= LARGE_VERTEX_BUFFER_SIZE {
                        size = self
                            .gpu_memory
                            .memory_layout_size(stream.gpu_addr_start, size);
                    }
                    self.resolve(device_addr, size)
                }
                _ => NULL_BINDING,
            };
            self.channel.vertex_buffers[index] = binding;
        }
    }

    fn update_transform_feedback_buffers(&mut self) {
        if !self.channel.transform_feedback_enabled {
            return;
        }
        for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
            if self.channel.transform_feedback_buffers[index].buffer_id.is_some() {
                continue;
            }
            let state = self.channel.transform_feedback_states[index];
            let device_addr = self.gpu_memory.gpu_to_cpu_address(state.gpu_addr);
            let binding = match device_addr {
                Some(device_addr) if state.enabled && state.size != 0 => {
                    self.resolve(device_addr, state.size)
                }
                _ => NULL_BINDING,
            };
            self.channel.transform_feedback_buffers[index] = binding;
        }
    }

    fn update_draw_indirect(&mut self) {
        let Some(params) = self.channel.draw_indirect else {
            return;
        };
        if params.include_count && self.channel.count_buffer.buffer_id.is_none() {
            self.channel.count_buffer = self.translate_and_resolve(params.count_start_address, 4);
        }
        if self.channel.indirect_buffer.buffer_id.is_none() {
            self.channel.indirect_buffer =
                self.translate_and_resolve(params.indirect_start_address, params.buffer_size);
        }
    }

    fn update_stage_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        for index in enabled_bits(self.channel.enabled_uniform_buffer_masks[set]) {
            let binding = self.channel.uniform_buffers[set][index];
            if binding.buffer_id.is_none() {
                let resolved = self.resolve(binding.device_addr, binding.size);
                self.channel.uniform_buffers[set][index] = resolved;
            }
        }
        for index in enabled_bits(self.channel.enabled_storage_buffers[set]) {
            let binding = self.channel.storage_buffers[set][index];
            if binding.buffer_id.is_none() {
                let resolved = self.resolve(binding.device_addr, binding.size);
                self.channel.storage_buffers[set][index] = resolved;
            }
        }
        for index in enabled_bits(self.channel.enabled_texture_buffers[set]) {
            let binding = self.channel.texture_buffers[set][index].binding;
            if binding.buffer_id.is_none() {
                let resolved = self.resolve(binding.device_addr, binding.size);
                self.channel.texture_buffers[set][index].binding = resolved;
            }
        }
    }

    fn resolve(&mut self, device_addr: DeviceAddr, size: u64) -> Binding {
        Binding {
            device_addr,
            size,
            buffer_id: Some(self.find_buffer(device_addr, size)),
        }
    }

    fn translate_and_resolve(&mut self, gpu_addr: GpuAddr, size: u64) -> Binding {
        match self.gpu_memory.gpu_to_cpu_address(gpu_addr) {
            Some(device_addr) => self.resolve(device_addr, size),
            None => NULL_BINDING,
        }
    }

    /// Touch and synchronize the buffer behind `binding`, returning where its range lives.
    fn prepare_binding(&mut self, binding: Binding) -> (BufferId, HostBuffer, u64) {
        let id = binding.buffer_id.unwrap_or(NULL_BUFFER_ID);
        let Some(buffer) = self.slot_buffers.get(id).filter(|_| id != NULL_BUFFER_ID) else {
            return (NULL_BUFFER_ID, self.null_host(), 0);
        };
        let (host, offset) = (buffer.host(), buffer.offset(binding.device_addr));
        self.touch_buffer(id);
        self.synchronize_buffer(id, binding.device_addr, binding.size);
        (id, host, offset)
    }

    /// Bind the index, vertex and transform feedback buffers resolved by the last update.
    pub fn bind_host_geometry_buffers(&mut self, is_indexed: bool) {
        if is_indexed {
            let binding = self.channel.index_buffer;
            let format = self
                .channel
                .index_state
                .map_or(IndexFormat::U32, |state| state.format);
            let (_, host, offset) = self.prepare_binding(binding);
            self.runtime
                .bind_index_buffer(host, offset, binding.size, format);
        }

        for index in 0..NUM_VERTEX_BUFFERS {
            let stream = self.channel.vertex_streams[index];
            if !stream.enabled {
                continue;
            }
            let binding = self.channel.vertex_buffers[index];
            let (_, host, offset) = self.prepare_binding(binding);
            self.runtime.bind_vertex_buffer(
                index as u32,
                host,
                offset,
                binding.size,
                stream.stride,
            );
        }

        if self.channel.transform_feedback_enabled {
            for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
                if !self.channel.transform_feedback_states[index].enabled {
                    continue;
                }
                let binding = self.channel.transform_feedback_buffers[index];
                let (id, host, offset) = self.prepare_binding(binding);
                self.mark_written_buffer(id, binding.device_addr, binding.size);
                self.runtime
                    .bind_transform_feedback_buffer(index as u32, host, offset, binding.size);
            }
        }
    }

    /// Bind the uniform, storage and texture buffers of one graphics stage.
    pub fn bind_host_stage_buffers(&mut self, stage: ShaderStage) {
        self.bind_host_uniform_buffers(stage);
        self.bind_host_storage_buffers(stage);
        self.bind_host_texture_buffers(stage);
    }

    pub fn bind_host_compute_buffers(&mut self) {
        self.bind_host_stage_buffers(ShaderStage::Compute);
    }

    fn bind_host_uniform_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        for index in enabled_bits(self.channel.enabled_uniform_buffer_masks[set]) {
            let binding = self.channel.uniform_buffers[set][index];
            let declared = u64::from(self.channel.uniform_buffer_sizes[set][index]);
            let size = if declared == 0 {
                binding.size
            } else {
                binding.size.min(declared)
            };
            let binding = Binding { size, ..binding };
            self.bind_host_uniform_buffer(stage, index as u32, binding);
        }
    }

    fn bind_host_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        binding: Binding,
    ) {
        let id = binding.buffer_id.unwrap_or(NULL_BUFFER_ID);
        let (addr, size) = (binding.device_addr, binding.size);
        let use_fast_buffer = id != NULL_BUFFER_ID
            && size != 0
            && size <= u64::from(self.channel.uniform_buffer_skip_cache_size)
            && !self.tracker.is_region_gpu_modified(addr, size);
        if use_fast_buffer {
            self.touch_buffer(id);
            let span = self
                .runtime
                .bind_mapped_uniform_buffer(stage, binding_index, size);
            self.memory.read_block(addr, span);
            self.stats.inc_uniform_fast_binds();
            return;
        }

        if id != NULL_BUFFER_ID && self.slot_buffers.contains(id) {
            self.touch_buffer(id);
            if self.synchronize_buffer(id, addr, size) {
                self.channel.uniform_cache_hits[0] += 1;
            }
            self.channel.uniform_cache_shots[0] += 1;
        }
        let (host, offset) = match self.slot_buffers.get(id).filter(|_| id != NULL_BUFFER_ID) {
            Some(buffer) => (buffer.host(), buffer.offset(addr)),
            None => (self.null_host(), 0),
        };
        self.runtime
            .bind_uniform_buffer(stage, binding_index, host, offset, size);
    }

    fn bind_host_storage_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        for index in enabled_bits(self.channel.enabled_storage_buffers[set]) {
            let binding = self.channel.storage_buffers[set][index];
            let is_written = is_bit_set(self.channel.written_storage_buffers[set], index);
            let (id, host, offset) = self.prepare_binding(binding);
            if is_written {
                self.mark_written_buffer(id, binding.device_addr, binding.size);
            }
            self.runtime.bind_storage_buffer(
                stage,
                index as u32,
                host,
                offset,
                binding.size,
                is_written,
            );
        }
    }

    fn bind_host_texture_buffers(&mut self, stage: ShaderStage) {
        let set = stage.index();
        for index in enabled_bits(self.channel.enabled_texture_buffers[set]) {
            let TextureBufferBinding { binding, format } = self.channel.texture_buffers[set][index];
            let (id, host, offset) = self.prepare_binding(binding);
            if is_bit_set(self.channel.written_texture_buffers[set], index) {
                self.mark_written_buffer(id, binding.device_addr, binding.size);
            }
            if is_bit_set(self.channel.image_texture_buffers[set], index) {
                self.runtime
                    .bind_image_buffer(host, offset, binding.size, format);
            } else {
                self.runtime
                    .bind_texture_buffer(host, offset, binding.size, format);
            }
        }
    }

    /// Host location of the indirect draw arguments resolved by the last update.
    pub fn draw_indirect_buffer(&mut self) -> (HostBuffer, u64) {
        let binding = self.channel.indirect_buffer;
        let (_, host, offset) = self.prepare_binding(binding);
        (host, offset)
    }

    /// Host location of the indirect draw count resolved by the last update.
    pub fn draw_indirect_count(&mut self) -> (HostBuffer, u64) {
        let binding = self.channel.count_buffer;
        let (_, host, offset) = self.prepare_binding(binding);
        (host, offset)
    }

    /// Direct access to the buffer backing `[gpu_addr, gpu_addr + size)`.
    ///
    /// Untranslatable addresses yield the null buffer.
    pub fn obtain_buffer(
        &mut self,
        gpu_addr: GpuAddr,
        size: u64,
        sync: ObtainBufferSynchronize,
        op: ObtainBufferOperation,
    ) -> ObtainedBuffer {
        match self.gpu_memory.gpu_to_cpu_address(gpu_addr) {
            Some(device_addr) => self.obtain_cpu_buffer(device_addr, size, sync, op),
            None => ObtainedBuffer {
                id: NULL_BUFFER_ID,
                host: self.null_host(),
                offset: 0,
            },
        }
    }

    pub fn obtain_cpu_buffer(
        &mut self,
        device_addr: DeviceAddr,
        size: u64,
        sync: ObtainBufferSynchronize,
        op: ObtainBufferOperation,
    ) -> ObtainedBuffer {
        let id = self.find_buffer(device_addr, size);
        self.touch_buffer(id);
        match sync {
            ObtainBufferSynchronize::NoSynchronize => {}
            ObtainBufferSynchronize::FullSynchronize => {
                self.synchronize_buffer(id, device_addr, size);
            }
            ObtainBufferSynchronize::SynchronizeNoDirty => {
                if !self.is_region_gpu_modified(device_addr, size) {
                    self.synchronize_buffer(id, device_addr, size);
                }
            }
        }
        match op {
            ObtainBufferOperation::DoNothing => {}
            ObtainBufferOperation::MarkAsWritten => {
                self.mark_written_buffer(id, device_addr, size);
            }
            ObtainBufferOperation::DiscardWrite => {
                let start = align_down(device_addr, DISCARD_ALIGNMENT);
                let end = align_up(device_addr.saturating_add(size), DISCARD_ALIGNMENT);
                self.clear_download(start, end - start);
                self.gpu_modified_ranges.subtract(start, end - start);
            }
            ObtainBufferOperation::MarkQuery => {
                if id != NULL_BUFFER_ID {
                    self.slot_buffers[id]
                        .set_flags(BufferFlags::DOWNLOAD_EACH_FRAME, true);
                }
                self.mark_written_buffer(id, device_addr, size);
            }
        }

        let buffer = &self.slot_buffers[id];
        ObtainedBuffer {
            id,
            host: buffer.host(),
            offset: if id == NULL_BUFFER_ID {
                0
            } else {
                buffer.offset(device_addr)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::BufferCacheConfig;
    use crate::memory::{PagedGpuMemory, VecDeviceMemory};
    use crate::runtime::{BindRecord, SoftBufferRuntime};
    use crate::BufferCache;

    type TestCache = BufferCache<SoftBufferRuntime, VecDeviceMemory, PagedGpuMemory>;

    fn cache() -> TestCache {
        let mut gpu_memory = PagedGpuMemory::new();
        gpu_memory.map_identity(0x1000, 0x40_0000 - 0x1000);
        BufferCache::new(
            BufferCacheConfig::default(),
            SoftBufferRuntime::new(),
            VecDeviceMemory::new(0x40_0000),
            gpu_memory,
        )
        .unwrap()
    }

    fn draw(cache: &mut TestCache, stage: ShaderStage) {
        cache.update_graphics_buffers(false);
        cache.bind_host_stage_buffers(stage);
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let mut cache = cache();
        assert_eq!(
            cache.bind_uniform_buffer(ShaderStage::Compute, 8, 0x1000, 16),
            Err(BufferCacheError::SlotOutOfRange {
                kind: SlotKind::Uniform,
                index: 8,
                max: 8
            })
        );
        assert!(cache
            .bind_uniform_buffer(ShaderStage::Fragment, 17, 0x1000, 16)
            .is_ok());
        assert!(cache
            .set_vertex_buffer(NUM_VERTEX_BUFFERS, VertexStreamState::default())
            .is_err());
        assert!(cache
            .set_transform_feedback(4, TransformFeedbackBufferState::default())
            .is_err());
        assert!(cache
            .bind_storage_buffer(ShaderStage::Vertex, 16, 0, 0x1000, false)
            .is_err());
        assert!(cache
            .bind_texture_buffer(
                ShaderStage::Vertex,
                32,
                0x1000,
                16,
                PixelFormat::INVALID,
                false,
                false
            )
            .is_err());
        assert_eq!(
            cache.set_uniform_buffers_state(ShaderStage::Compute, 1 << 9, &[]),
            Err(BufferCacheError::SlotOutOfRange {
                kind: SlotKind::Uniform,
                index: 9,
                max: 8
            })
        );
    }

    #[test]
    fn uniform_buffers_are_clipped_to_the_declared_size() {
        let mut cache = cache();
        cache.memory_mut().write_block(0x1000, &[0xab; 0x100]);
        cache
            .set_uniform_buffers_state(ShaderStage::Vertex, 0b1, &[0x100])
            .unwrap();
        cache
            .bind_uniform_buffer(ShaderStage::Vertex, 0, 0x1000, 0x1000)
            .unwrap();

        draw(&mut cache, ShaderStage::Vertex);
        assert_eq!(cache.runtime().uploaded_bytes(), 0x100);
        let id = cache.channel.uniform_buffers[0][0].buffer_id.unwrap();
        let host = cache.buffer(id).unwrap().host();
        assert_eq!(
            cache.runtime().binds(),
            &[BindRecord::Uniform {
                stage: ShaderStage::Vertex,
                binding_index: 0,
                buffer: host,
                offset: 0x1000,
                size: 0x100,
            }]
        );
        assert_eq!(cache.channel.uniform_cache_shots[0], 1);
        assert_eq!(cache.channel.uniform_cache_hits[0], 0);

        draw(&mut cache, ShaderStage::Vertex);
        assert_eq!(cache.runtime().uploaded_bytes(), 0x100);
        assert_eq!(cache.channel.uniform_cache_hits[0], 1);
    }

    #[test]
    fn missing_uniform_hits_enable_the_mapped_path() {
        let mut cache = cache();
        cache.memory_mut().write_block(0x2000, &[1, 2, 3, 4]);
        cache
            .set_uniform_buffers_state(ShaderStage::Fragment, 0b10, &[0, 0])
            .unwrap();
        cache
            .bind_uniform_buffer(ShaderStage::Fragment, 1, 0x2000, 4)
            .unwrap();

        draw(&mut cache, ShaderStage::Fragment);
        cache.tick_frame();
        assert_eq!(cache.channel.uniform_buffer_skip_cache_size, 4096);

        cache.runtime_mut().clear_logs();
        draw(&mut cache, ShaderStage::Fragment);
        assert_eq!(
            cache.runtime().binds(),
            &[BindRecord::MappedUniform {
                stage: ShaderStage::Fragment,
                binding_index: 1,
                size: 4,
            }]
        );
        assert_eq!(cache.runtime().last_mapped_uniform(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(cache.stats().snapshot().uniform_fast_binds, 1);

        // The mapped path stays on until the last cached-path shot leaves the 16 frame window.
        for _ in 0..15 {
            cache.tick_frame();
            assert_eq!(cache.channel.uniform_buffer_skip_cache_size, 4096);
        }
        cache.tick_frame();
        assert_eq!(cache.channel.uniform_buffer_skip_cache_size, 0);
    }

    #[test]
    fn written_storage_buffers_become_gpu_modified() {
        let mut cache = cache();
        cache.memory_mut().write_obj(0x2_0000, &0x3_0014u64);
        cache.memory_mut().write_obj(0x2_0008, &0x40u32);
        cache
            .bind_storage_buffer(ShaderStage::Compute, 2, 0, 0x2_0000, true)
            .unwrap();

        cache.update_compute_buffers();
        cache.bind_host_compute_buffers();
        let stage = ShaderStage::Compute.index();
        let binding = cache.channel.storage_buffers[stage][2];
        assert_eq!((binding.device_addr, binding.size), (0x3_0010, 0x44));
        let host = cache.buffer(binding.buffer_id.unwrap()).unwrap().host();
        assert_eq!(
            cache.runtime().binds(),
            &[BindRecord::Storage {
                stage: ShaderStage::Compute,
                binding_index: 2,
                buffer: host,
                offset: 0x10,
                size: 0x44,
                is_written: true,
            }]
        );
        assert!(cache.is_region_gpu_modified(0x3_0010, 0x44));
    }

    #[test]
    fn unmapped_storage_descriptors_bind_null() {
        let mut cache = cache();
        cache
            .bind_storage_buffer(ShaderStage::Vertex, 0, 0, 0x80_0000, false)
            .unwrap();
        draw(&mut cache, ShaderStage::Vertex);
        let null_host = cache.null_host();
        assert!(matches!(
            cache.runtime().binds(),
            [BindRecord::Storage { buffer, offset: 0, size: 0, .. }] if *buffer == null_host
        ));
        assert_eq!(cache.buffer_count(), 0);
    }

    #[test]
    fn deleted_buffers_are_resolved_again() {
        let mut cache = cache();
        cache
            .set_uniform_buffers_state(ShaderStage::Vertex, 0b1, &[])
            .unwrap();
        cache
            .bind_uniform_buffer(ShaderStage::Vertex, 0, 0x1_0100, 0x100)
            .unwrap();
        cache.update_graphics_buffers(false);
        let first = cache.channel.uniform_buffers[0][0].buffer_id.unwrap();

        let merged = cache.find_buffer(0x1_0000, 0x2_0000);
        assert!(!cache.is_buffer_valid(first));
        assert_eq!(cache.channel.uniform_buffers[0][0].buffer_id, None);

        cache.update_graphics_buffers(false);
        assert_eq!(cache.channel.uniform_buffers[0][0].buffer_id, Some(merged));
    }

    #[test]
    fn geometry_buffers_bind_index_vertex_and_feedback() {
        let mut cache = cache();
        cache.set_index_buffer(Some(IndexBufferState {
            gpu_addr_start: 0x5_0000,
            gpu_addr_end: 0x5_1000,
            format: IndexFormat::U16,
            first: 2,
            count: 6,
        }));
        cache
            .set_vertex_buffer(
                3,
                VertexStreamState {
                    enabled: true,
                    gpu_addr_start: 0x6_0000,
                    gpu_addr_end: 0x6_0400,
                    stride: 16,
                },
            )
            .unwrap();
        cache.set_transform_feedback_enabled(true);
        cache
            .set_transform_feedback(
                1,
                TransformFeedbackBufferState {
                    enabled: true,
                    gpu_addr: 0x7_0000,
                    size: 0x200,
                },
            )
            .unwrap();

        cache.update_graphics_buffers(true);
        cache.bind_host_geometry_buffers(true);
        let binds = cache.runtime().binds();
        assert_eq!(binds.len(), 3);
        assert!(matches!(
            binds[0],
            BindRecord::Index {
                size: 16,
                format: IndexFormat::U16,
                ..
            }
        ));
        assert!(matches!(
            binds[1],
            BindRecord::Vertex {
                index: 3,
                size: 0x400,
                stride: 16,
                ..
            }
        ));
        assert!(matches!(
            binds[2],
            BindRecord::TransformFeedback {
                index: 1,
                size: 0x200,
                ..
            }
        ));
        assert!(cache.is_region_gpu_modified(0x7_0000, 0x200));
        assert!(!cache.is_region_gpu_modified(0x6_0000, 0x400));
    }

    #[test]
    fn indirect_arguments_resolve_to_buffers() {
        let mut cache = cache();
        cache.set_draw_indirect(Some(DrawIndirectParams {
            indirect_start_address: 0x8_0040,
            buffer_size: 0x40,
            include_count: true,
            count_start_address: 0x9_0000,
        }));
        cache.update_graphics_buffers(false);

        let (host, offset) = cache.draw_indirect_buffer();
        let id = cache.buffer_at(0x8_0040).unwrap();
        assert_eq!((host, offset), (cache.buffer(id).unwrap().host(), 0x40));
        let (count_host, count_offset) = cache.draw_indirect_count();
        assert_ne!(count_host, cache.null_host());
        assert_eq!(count_offset, 0);
    }

    #[test]
    fn obtain_buffer_applies_the_requested_operation() {
        let mut cache = cache();
        cache.memory_mut().write_block(0x3000, &[5; 8]);
        let obtained = cache.obtain_buffer(
            0x3000,
            8,
            ObtainBufferSynchronize::FullSynchronize,
            ObtainBufferOperation::MarkAsWritten,
        );
        assert_eq!(obtained.offset, 0x3000);
        let contents = cache.runtime().buffer_contents(obtained.host).unwrap();
        assert_eq!(&contents[0x3000..0x3008], &[5; 8]);
        assert!(cache.is_region_gpu_modified(0x3000, 8));

        cache.memory_mut().write_block(0x3000, &[6; 8]);
        cache.write_memory(0x3010, 8);
        cache.obtain_cpu_buffer(
            0x3000,
            0x20,
            ObtainBufferSynchronize::SynchronizeNoDirty,
            ObtainBufferOperation::DiscardWrite,
        );
        // GPU results were present, so the CPU write was not uploaded yet.
        assert!(cache.is_region_cpu_modified(0x3010, 8));
        assert!(!cache.is_region_gpu_modified(0x3000, 0x40));

        let query = cache.obtain_buffer(
            0x3100,
            8,
            ObtainBufferSynchronize::NoSynchronize,
            ObtainBufferOperation::MarkQuery,
        );
        assert!(cache
            .buffer(query.id)
            .unwrap()
            .flags()
            .contains(BufferFlags::DOWNLOAD_EACH_FRAME));
        assert!(cache.is_region_gpu_modified(0x3100, 8));

        let unmapped = cache.obtain_buffer(
            0x80_0000,
            8,
            ObtainBufferSynchronize::FullSynchronize,
            ObtainBufferOperation::MarkAsWritten,
        );
        assert_eq!(unmapped.id, NULL_BUFFER_ID);
    }
}
