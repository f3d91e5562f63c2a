//! Caching-page to buffer index.

use hashbrown::HashMap;

use crate::addr::{div_ceil, DeviceAddr};
use crate::buffer::BufferId;

/// Sparse map from caching page number to the buffer that owns it.
#[derive(Debug)]
pub(crate) struct PageTable {
    page_bits: u32,
    pages: HashMap<u64, BufferId>,
}

impl PageTable {
    pub fn new(page_bits: u32) -> Self {
        Self {
            page_bits,
            pages: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    pub fn page_of(&self, addr: DeviceAddr) -> u64 {
        addr >> self.page_bits
    }

    /// Page numbers spanned by `[addr, addr + size)`.
    pub fn pages_of(&self, addr: DeviceAddr, size: u64) -> core::ops::Range<u64> {
        let end = addr.saturating_add(size);
        self.page_of(addr)..div_ceil(end, self.page_size())
    }

    pub fn get(&self, page: u64) -> Option<BufferId> {
        self.pages.get(&page).copied()
    }

    pub fn lookup(&self, addr: DeviceAddr) -> Option<BufferId> {
        self.get(self.page_of(addr))
    }

    pub fn register(&mut self, addr: DeviceAddr, size: u64, id: BufferId) {
        for page in self.pages_of(addr, size) {
            let previous = self.pages.insert(page, id);
            debug_assert!(
                previous.is_none(),
                "caching page {page:#x} already owned by {previous:?} while registering {id:?}"
            );
        }
    }

    pub fn unregister(&mut self, addr: DeviceAddr, size: u64, id: BufferId) {
        for page in self.pages_of(addr, size) {
            let previous = self.pages.remove(&page);
            debug_assert_eq!(previous, Some(id), "caching page {page:#x} not owned by {id:?}");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (u64, BufferId)> + '_ {
        self.pages.iter().map(|(&page, &id)| (page, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotId;

    #[test]
    fn registers_every_spanned_page() {
        let mut table = PageTable::new(16);
        let id = SlotId::from_raw(3, 0);
        table.register(0x2_0000, 0x3_0000, id);
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(0x2_0000), Some(id));
        assert_eq!(table.lookup(0x4_ffff), Some(id));
        assert_eq!(table.lookup(0x5_0000), None);
        assert_eq!(table.pages_of(0x1_8000, 0x1_0000), 1..3);

        table.unregister(0x2_0000, 0x3_0000, id);
        assert_eq!(table.len(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already owned")]
    fn double_ownership_is_rejected() {
        let mut table = PageTable::new(12);
        table.register(0x1000, 0x2000, SlotId::from_raw(1, 0));
        table.register(0x2000, 0x1000, SlotId::from_raw(2, 0));
    }
}
