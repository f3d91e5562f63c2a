use hashbrown::{HashMap, HashSet};
use tracing::warn;

use super::{BufferCopy, BufferRuntime, HostBuffer, IndexFormat, RuntimeCapabilities, StagingBuffer};
use crate::bindings::{PixelFormat, ShaderStage};

/// Bytes moved between the CPU side and a (non-staging) host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub buffer: HostBuffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindRecord {
    Index {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: IndexFormat,
    },
    Vertex {
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        stride: u32,
    },
    Uniform {
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
    MappedUniform {
        stage: ShaderStage,
        binding_index: u32,
        size: u64,
    },
    Storage {
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        is_written: bool,
    },
    Texture {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    },
    Image {
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    },
    TransformFeedback {
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    },
}

/// Deterministic CPU-side [`BufferRuntime`].
///
/// Every host buffer is a `Vec<u8>` and every command executes immediately, which makes the
/// runtime suitable for tests and headless builds. Transfers and binds are logged so callers can
/// assert on exactly what the cache asked the backend to do.
#[derive(Debug, Default)]
pub struct SoftBufferRuntime {
    capabilities: RuntimeCapabilities,
    next_handle: u64,
    buffers: HashMap<HostBuffer, Vec<u8>>,
    staging: HashSet<HostBuffer>,
    /// Staging allocations released on the next tick.
    frame_staging: Vec<HostBuffer>,
    uploads: Vec<TransferRecord>,
    downloads: Vec<TransferRecord>,
    binds: Vec<BindRecord>,
    mapped_uniforms: Vec<Vec<u8>>,
    copy_calls: u64,
    clear_calls: u64,
    finish_calls: u64,
    frames: u64,
}

impl SoftBufferRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: RuntimeCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    pub fn set_capabilities(&mut self, capabilities: RuntimeCapabilities) {
        self.capabilities = capabilities;
    }

    pub fn buffer_contents(&self, buffer: HostBuffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    /// Live buffers, excluding staging allocations.
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len() - self.staging.len()
    }

    pub fn staging_count(&self) -> usize {
        self.staging.len()
    }

    pub fn uploads(&self) -> &[TransferRecord] {
        &self.uploads
    }

    pub fn downloads(&self) -> &[TransferRecord] {
        &self.downloads
    }

    pub fn binds(&self) -> &[BindRecord] {
        &self.binds
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploads.iter().map(|record| record.size).sum()
    }

    pub fn last_mapped_uniform(&self) -> Option<&[u8]> {
        self.mapped_uniforms.last().map(Vec::as_slice)
    }

    pub fn copy_calls(&self) -> u64 {
        self.copy_calls
    }

    pub fn clear_calls(&self) -> u64 {
        self.clear_calls
    }

    pub fn finish_calls(&self) -> u64 {
        self.finish_calls
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Forget logged transfers and binds.
    pub fn clear_logs(&mut self) {
        self.uploads.clear();
        self.downloads.clear();
        self.binds.clear();
        self.mapped_uniforms.clear();
    }

    fn allocate(&mut self, size: u64) -> HostBuffer {
        self.next_handle += 1;
        let handle = HostBuffer(self.next_handle);
        self.buffers.insert(handle, vec![0; size as usize]);
        handle
    }

    fn allocate_staging(&mut self, size: u64) -> StagingBuffer {
        let buffer = self.allocate(size);
        self.staging.insert(buffer);
        StagingBuffer {
            buffer,
            offset: 0,
            size,
        }
    }

    fn release(&mut self, buffer: HostBuffer) {
        self.staging.remove(&buffer);
        if self.buffers.remove(&buffer).is_none() {
            warn!(?buffer, "release of unknown host buffer");
        }
    }

    fn span_mut(&mut self, buffer: HostBuffer, offset: u64, size: u64) -> Option<&mut [u8]> {
        let data = self.buffers.get_mut(&buffer)?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        data.get_mut(start..end)
    }
}

impl BufferRuntime for SoftBufferRuntime {
    fn capabilities(&self) -> RuntimeCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, size: u64) -> HostBuffer {
        self.allocate(size)
    }

    fn destroy_buffer(&mut self, buffer: HostBuffer) {
        self.release(buffer);
    }

    fn copy_buffer(
        &mut self,
        dst: HostBuffer,
        src: HostBuffer,
        copies: &[BufferCopy],
        _barrier: bool,
    ) {
        self.copy_calls += 1;
        let from_staging = self.staging.contains(&src);
        let to_staging = self.staging.contains(&dst);
        for copy in copies {
            let Some(bytes) = self
                .span_mut(src, copy.src_offset, copy.size)
                .map(|span| span.to_vec())
            else {
                warn!(?src, ?copy, "copy source out of bounds");
                continue;
            };
            let Some(target) = self.span_mut(dst, copy.dst_offset, copy.size) else {
                warn!(?dst, ?copy, "copy destination out of bounds");
                continue;
            };
            target.copy_from_slice(&bytes);
            if from_staging && !to_staging {
                self.uploads.push(TransferRecord {
                    buffer: dst,
                    offset: copy.dst_offset,
                    size: copy.size,
                });
            }
            if to_staging && !from_staging {
                self.downloads.push(TransferRecord {
                    buffer: src,
                    offset: copy.src_offset,
                    size: copy.size,
                });
            }
        }
    }

    fn clear_buffer(&mut self, buffer: HostBuffer, offset: u64, size: u64, value: u32) {
        self.clear_calls += 1;
        let Some(target) = self.span_mut(buffer, offset, size) else {
            warn!(?buffer, offset, size, "clear out of bounds");
            return;
        };
        let pattern = value.to_le_bytes();
        for (i, byte) in target.iter_mut().enumerate() {
            *byte = pattern[i % pattern.len()];
        }
    }

    fn immediate_upload(&mut self, buffer: HostBuffer, offset: u64, data: &[u8]) {
        let Some(target) = self.span_mut(buffer, offset, data.len() as u64) else {
            warn!(?buffer, offset, size = data.len(), "upload out of bounds");
            return;
        };
        target.copy_from_slice(data);
        self.uploads.push(TransferRecord {
            buffer,
            offset,
            size: data.len() as u64,
        });
    }

    fn immediate_download(&mut self, buffer: HostBuffer, offset: u64, dst: &mut [u8]) {
        let Some(source) = self.span_mut(buffer, offset, dst.len() as u64) else {
            warn!(?buffer, offset, size = dst.len(), "download out of bounds");
            dst.fill(0);
            return;
        };
        dst.copy_from_slice(source);
        self.downloads.push(TransferRecord {
            buffer,
            offset,
            size: dst.len() as u64,
        });
    }

    fn upload_staging_buffer(&mut self, size: u64) -> StagingBuffer {
        let staging = self.allocate_staging(size);
        self.frame_staging.push(staging.buffer);
        staging
    }

    fn download_staging_buffer(&mut self, size: u64, deferred: bool) -> StagingBuffer {
        let staging = self.allocate_staging(size);
        if !deferred {
            self.frame_staging.push(staging.buffer);
        }
        staging
    }

    fn free_deferred_staging_buffer(&mut self, staging: StagingBuffer) {
        self.release(staging.buffer);
    }

    fn mapped_span(&mut self, staging: &StagingBuffer) -> &mut [u8] {
        match self.span_mut(staging.buffer, staging.offset, staging.size) {
            Some(span) => span,
            None => panic!("staging allocation {staging:?} is not mapped"),
        }
    }

    fn pre_copy_barrier(&mut self) {}

    fn post_copy_barrier(&mut self) {}

    fn finish(&mut self) {
        self.finish_calls += 1;
    }

    fn tick_frame(&mut self) {
        self.frames += 1;
        for buffer in std::mem::take(&mut self.frame_staging) {
            self.release(buffer);
        }
    }

    fn device_memory_usage(&self) -> u64 {
        self.buffers
            .iter()
            .filter(|(handle, _)| !self.staging.contains(*handle))
            .map(|(_, data)| data.len() as u64)
            .sum()
    }

    fn bind_index_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: IndexFormat,
    ) {
        self.binds.push(BindRecord::Index {
            buffer,
            offset,
            size,
            format,
        });
    }

    fn bind_vertex_buffer(
        &mut self,
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        stride: u32,
    ) {
        self.binds.push(BindRecord::Vertex {
            index,
            buffer,
            offset,
            size,
            stride,
        });
    }

    fn bind_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    ) {
        self.binds.push(BindRecord::Uniform {
            stage,
            binding_index,
            buffer,
            offset,
            size,
        });
    }

    fn bind_mapped_uniform_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        size: u64,
    ) -> &mut [u8] {
        self.binds.push(BindRecord::MappedUniform {
            stage,
            binding_index,
            size,
        });
        self.mapped_uniforms.push(vec![0; size as usize]);
        let last = self.mapped_uniforms.len() - 1;
        &mut self.mapped_uniforms[last]
    }

    fn bind_storage_buffer(
        &mut self,
        stage: ShaderStage,
        binding_index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        is_written: bool,
    ) {
        self.binds.push(BindRecord::Storage {
            stage,
            binding_index,
            buffer,
            offset,
            size,
            is_written,
        });
    }

    fn bind_texture_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    ) {
        self.binds.push(BindRecord::Texture {
            buffer,
            offset,
            size,
            format,
        });
    }

    fn bind_image_buffer(
        &mut self,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
        format: PixelFormat,
    ) {
        self.binds.push(BindRecord::Image {
            buffer,
            offset,
            size,
            format,
        });
    }

    fn bind_transform_feedback_buffer(
        &mut self,
        index: u32,
        buffer: HostBuffer,
        offset: u64,
        size: u64,
    ) {
        self.binds.push(BindRecord::TransformFeedback {
            index,
            buffer,
            offset,
            size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_copies_are_logged_as_transfers() {
        let mut rt = SoftBufferRuntime::new();
        let buffer = rt.create_buffer(0x100);

        let staging = rt.upload_staging_buffer(0x10);
        rt.mapped_span(&staging).copy_from_slice(&[0xab; 0x10]);
        rt.copy_buffer(
            buffer,
            staging.buffer,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0x40,
                size: 0x10,
            }],
            true,
        );
        assert_eq!(
            rt.uploads(),
            &[TransferRecord {
                buffer,
                offset: 0x40,
                size: 0x10
            }]
        );
        assert_eq!(&rt.buffer_contents(buffer).unwrap()[0x40..0x50], &[0xab; 0x10]);

        // Upload staging only lives until the end of the frame.
        assert_eq!(rt.staging_count(), 1);
        rt.tick_frame();
        assert_eq!(rt.staging_count(), 0);
        assert_eq!(rt.live_buffer_count(), 1);
    }

    #[test]
    fn clear_repeats_the_word_pattern() {
        let mut rt = SoftBufferRuntime::new();
        let buffer = rt.create_buffer(8);
        rt.clear_buffer(buffer, 0, 8, 0x0403_0201);
        assert_eq!(rt.buffer_contents(buffer).unwrap(), &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(rt.device_memory_usage(), 8);
    }

    #[test]
    fn deferred_download_staging_survives_ticks() {
        let mut rt = SoftBufferRuntime::new();
        let staging = rt.download_staging_buffer(0x40, true);
        rt.tick_frame();
        assert_eq!(rt.mapped_span(&staging).len(), 0x40);
        rt.free_deferred_staging_buffer(staging);
        assert_eq!(rt.staging_count(), 0);
    }
}
