use super::descriptor::PageTableEntry;
use super::PAGESIZE;
use allocators::PoolPage;
use core::mem;
use core::ptr::NonNull;
use static_assertions::{assert_eq_align, assert_eq_size};

/// Number of entries in one translation table page
pub const ENTRIES_PER_TABLE: usize = PAGESIZE / mem::size_of::<PageTableEntry>();

/// A translation table of any level.
///
/// It exactly fills 4096 bytes which is also the size of the smallest mapped pages.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

assert_eq_size!(PageTable, PoolPage);
assert_eq_align!(PageTable, PoolPage);

impl PageTable {
    /// Initialize the given pages with empty `PageTable`s
    pub fn init(pages: NonNull<PoolPage>, count: usize) -> NonNull<PageTable> {
        log::trace!("initializing {count} empty page tables at {pages:p}");
        let table = pages.cast::<PageTableEntry>().as_ptr();
        for i in 0..count * ENTRIES_PER_TABLE {
            unsafe { table.add(i).write(PageTableEntry::empty()) };
        }
        pages.cast()
    }

    /// Whether no entry of this table is valid
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_valid())
    }
}
