//! Guest memory access and GPU address translation.

use bytemuck::Pod;
use hashbrown::HashMap;

use crate::addr::{div_ceil, DeviceAddr, GpuAddr, DEVICE_PAGE_BITS, DEVICE_PAGE_SIZE};

/// Byte-level access to the emulated console's main memory.
///
/// Accesses are infallible: the memory model of the guest treats unbacked addresses as open bus,
/// so implementations read zeros and drop writes there instead of failing.
pub trait DeviceMemory {
    fn read_block(&self, addr: DeviceAddr, dst: &mut [u8]);

    fn write_block(&mut self, addr: DeviceAddr, src: &[u8]);

    fn read_obj<T: Pod>(&self, addr: DeviceAddr) -> T
    where
        Self: Sized,
    {
        let mut value = T::zeroed();
        self.read_block(addr, bytemuck::bytes_of_mut(&mut value));
        value
    }

    fn write_obj<T: Pod>(&mut self, addr: DeviceAddr, value: &T)
    where
        Self: Sized,
    {
        self.write_block(addr, bytemuck::bytes_of(value));
    }
}

/// Translation from GPU virtual addresses to guest addresses.
pub trait GpuMemory {
    /// Returns `None` for unmapped addresses.
    fn gpu_to_cpu_address(&self, gpu_addr: GpuAddr) -> Option<DeviceAddr>;

    /// Number of bytes starting at `gpu_addr` that are mapped to contiguous guest memory, capped
    /// at `max_size`.
    fn memory_layout_size(&self, gpu_addr: GpuAddr, max_size: u64) -> u64;
}

/// Flat guest memory starting at address 0.
#[derive(Clone, Debug)]
pub struct VecDeviceMemory {
    data: Vec<u8>,
}

impl VecDeviceMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the backed part of `[addr, addr + len)`.
    fn backed(&self, addr: DeviceAddr, len: usize) -> Option<(usize, usize)> {
        let start = usize::try_from(addr).ok()?;
        if start >= self.data.len() {
            return None;
        }
        let end = start.saturating_add(len).min(self.data.len());
        Some((start, end))
    }
}

impl DeviceMemory for VecDeviceMemory {
    fn read_block(&self, addr: DeviceAddr, dst: &mut [u8]) {
        dst.fill(0);
        if let Some((start, end)) = self.backed(addr, dst.len()) {
            dst[..end - start].copy_from_slice(&self.data[start..end]);
        }
    }

    fn write_block(&mut self, addr: DeviceAddr, src: &[u8]) {
        if let Some((start, end)) = self.backed(addr, src.len()) {
            self.data[start..end].copy_from_slice(&src[..end - start]);
        }
    }
}

/// GPU virtual address space backed by a sparse table of 4 KiB mappings.
#[derive(Clone, Debug, Default)]
pub struct PagedGpuMemory {
    /// GPU page -> guest page base address.
    pages: HashMap<u64, DeviceAddr>,
}

impl PagedGpuMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `[gpu_addr, gpu_addr + size)` onto guest memory starting at `cpu_addr`.
    ///
    /// Both addresses are truncated to page boundaries and the size is rounded up to whole pages.
    pub fn map(&mut self, gpu_addr: GpuAddr, cpu_addr: DeviceAddr, size: u64) {
        let gpu_base = gpu_addr >> DEVICE_PAGE_BITS;
        let cpu_base = cpu_addr & !(DEVICE_PAGE_SIZE - 1);
        let pages = div_ceil(size + (gpu_addr & (DEVICE_PAGE_SIZE - 1)), DEVICE_PAGE_SIZE);
        for i in 0..pages {
            self.pages
                .insert(gpu_base + i, cpu_base + i * DEVICE_PAGE_SIZE);
        }
    }

    /// Identity-map a range, the common layout in tests and homebrew titles.
    pub fn map_identity(&mut self, addr: u64, size: u64) {
        self.map(addr, addr, size);
    }

    pub fn unmap(&mut self, gpu_addr: GpuAddr, size: u64) {
        let gpu_base = gpu_addr >> DEVICE_PAGE_BITS;
        let pages = div_ceil(size + (gpu_addr & (DEVICE_PAGE_SIZE - 1)), DEVICE_PAGE_SIZE);
        for i in 0..pages {
            self.pages.remove(&(gpu_base + i));
        }
    }
}

impl GpuMemory for PagedGpuMemory {
    fn gpu_to_cpu_address(&self, gpu_addr: GpuAddr) -> Option<DeviceAddr> {
        let base = self.pages.get(&(gpu_addr >> DEVICE_PAGE_BITS))?;
        Some(base + (gpu_addr & (DEVICE_PAGE_SIZE - 1)))
    }

    fn memory_layout_size(&self, gpu_addr: GpuAddr, max_size: u64) -> u64 {
        let Some(mut expected) = self.gpu_to_cpu_address(gpu_addr) else {
            return 0;
        };
        let mut size = 0u64;
        let mut cursor = gpu_addr;
        while size < max_size {
            match self.gpu_to_cpu_address(cursor) {
                Some(cpu) if cpu == expected => {}
                _ => break,
            }
            let in_page = DEVICE_PAGE_SIZE - (cursor & (DEVICE_PAGE_SIZE - 1));
            size += in_page;
            cursor += in_page;
            expected += in_page;
        }
        size.min(max_size)
    }
}
