//! Creation, destruction and software walks of translation table hierarchies
//!
//! [`PagingStructures`] is used for both, the hypervisor's own EL2 stage-1 tables and the stage-2 tables of cells.
//! The two only differ in their [`PagingFormat`] and in the meaning of the attribute bits which are passed through
//! opaquely.

use super::addr::{
    is_page_aligned, level_shift, level_size, page_align_down, PAddr, VAddr, INDEX_BITS,
    PAGE_OFFSET_MASK,
};
use super::descriptor::PageTableEntry;
use super::mapping::PhysMapping;
use super::page_table::{PageTable, ENTRIES_PER_TABLE};
use crate::cache;
use allocators::{AllocError, AllocInit, PageAllocator};
use core::fmt::{Debug, Formatter};
use core::mem::size_of;
use core::ptr::NonNull;
use thiserror_no_std::Error;

/// Number of output address bits supported by the tables
const OUTPUT_BITS: u64 = 48;

/// Geometry of a translation table hierarchy
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PagingFormat {
    /// Level at which translation table walks start
    pub start_level: usize,
    /// Number of concatenated pages that make up the root table
    pub root_pages: usize,
}

impl PagingFormat {
    /// Width of the input addresses that can be translated
    pub const fn input_bits(&self) -> u64 {
        level_shift(self.start_level) + INDEX_BITS + self.root_pages.trailing_zeros() as u64
    }

    /// First input address that cannot be translated anymore
    pub const fn input_limit(&self) -> u64 {
        1 << self.input_bits()
    }

    /// Number of entries of a table at `level`
    pub const fn entries(&self, level: usize) -> usize {
        if level == self.start_level {
            ENTRIES_PER_TABLE * self.root_pages
        } else {
            ENTRIES_PER_TABLE
        }
    }

    fn index(&self, level: usize, addr: u64) -> usize {
        (addr >> level_shift(level)) as usize & (self.entries(level) - 1)
    }
}

/// Hypervisor (EL2 stage-1) tables: 48-bit virtual addresses, walks start at level 0
pub const HYP_PAGING: PagingFormat = PagingFormat {
    start_level: 0,
    root_pages: 1,
};

/// Cell (stage-2) tables: 40-bit intermediate physical addresses, two concatenated level 1 tables as root
pub const CELL_PAGING: PagingFormat = PagingFormat {
    start_level: 1,
    root_pages: 2,
};

/// Whether the table walker observes table updates without explicit cache maintenance
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Coherency {
    /// Every written descriptor is cleaned to the point of coherency
    Coherent,
    /// Descriptors are only written, the caller takes care of cache maintenance
    NonCoherent,
}

/// The leaf entry found by a software walk
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Leaf {
    /// Translation of the looked up address, including its offset into the leaf
    pub phys: PAddr,
    /// Attribute bits of the leaf descriptor
    pub attrs: u64,
    /// Level of the table that holds the leaf
    pub level: usize,
    /// First input address covered by the leaf
    pub base: VAddr,
    /// Number of bytes covered by the leaf
    pub size: u64,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PagingError {
    #[error("insufficient memory for translation tables")]
    OutOfMemory,
    #[error("{addr:#x} is not mapped")]
    NotMapped { addr: u64 },
    #[error("{addr:#x} is outside of the {bits}-bit address range")]
    AddressOutOfRange { addr: u64, bits: u64 },
    #[error("{addr:#x} is not page aligned")]
    Misaligned { addr: u64 },
}

impl From<AllocError> for PagingError {
    fn from(_: AllocError) -> Self {
        PagingError::OutOfMemory
    }
}

/// A translation table hierarchy whose tables are allocated from a [`PageAllocator`].
///
/// All tables must live in memory described by `phys_map` because descriptors only hold physical addresses.
/// Block mappings are used whenever alignment and size permit, and they are split transparently when a part of
/// them is remapped or unmapped.
///
/// None of the operations invalidate TLBs; that is left to the caller who knows which translation regime is
/// affected.
pub struct PagingStructures {
    root: NonNull<PageTableEntry>,
    format: PagingFormat,
    phys_map: PhysMapping,
}

// Safety: The tables are exclusively owned by this struct and are only reachable through it
unsafe impl Send for PagingStructures {}

impl PagingStructures {
    /// Allocate an empty root table
    pub fn new(
        pool: &impl PageAllocator,
        format: PagingFormat,
        phys_map: PhysMapping,
    ) -> Result<Self, PagingError> {
        let pages = pool.alloc_aligned(format.root_pages, AllocInit::Uninitialized)?;
        let root = PageTable::init(pages, format.root_pages).cast();
        let paging = Self {
            root,
            format,
            phys_map,
        };
        log::debug!(
            "allocated {}-bit translation table root at {:#x}",
            format.input_bits(),
            paging.root_phys()
        );
        Ok(paging)
    }

    /// Take over an existing table hierarchy.
    ///
    /// # Safety
    /// `root` must be the physical address of a table hierarchy in `format` whose tables all live in `phys_map` and
    /// which nothing else modifies or frees for as long as the returned value exists.
    pub unsafe fn from_root(root: PAddr, format: PagingFormat, phys_map: PhysMapping) -> Self {
        let root = phys_map.phys_to_virt(root) as *mut PageTableEntry;
        assert!(!root.is_null());
        Self {
            root: NonNull::new_unchecked(root),
            format,
            phys_map,
        }
    }

    /// The physical address of the root table as it is programmed into a translation table base register
    pub fn root_phys(&self) -> PAddr {
        self.phys_map.virt_to_phys(self.root.as_ptr() as u64)
    }

    pub fn format(&self) -> &PagingFormat {
        &self.format
    }

    pub fn phys_map(&self) -> &PhysMapping {
        &self.phys_map
    }

    /// Map the `size` bytes at `virt` to `phys` with the given attribute bits, replacing whatever was mapped there
    /// before.
    ///
    /// All required intermediate tables are allocated from `pool`.
    /// If that fails, the part of the range that was mapped up to then stays mapped.
    pub fn create(
        &mut self,
        pool: &impl PageAllocator,
        phys: PAddr,
        size: u64,
        virt: VAddr,
        attrs: u64,
        coherency: Coherency,
    ) -> Result<(), PagingError> {
        let size = self.aligned_size(virt, size)?;
        if size == 0 {
            return Ok(());
        }
        self.check_input_range(virt, size)?;
        if !is_page_aligned(phys) {
            return Err(PagingError::Misaligned { addr: phys });
        }
        if phys.checked_add(size).map_or(true, |end| end > 1 << OUTPUT_BITS) {
            return Err(PagingError::AddressOutOfRange {
                addr: phys,
                bits: OUTPUT_BITS,
            });
        }

        log::trace!(
            "mapping {virt:#x}..{:#x} -> {phys:#x} (attrs={attrs:#x}) in tables at {:#x}",
            virt + size,
            self.root_phys()
        );
        self.map_range(
            pool,
            self.root,
            self.format.start_level,
            virt,
            virt + size,
            phys,
            attrs,
            coherency,
        )
    }

    /// Remove the mappings of the `size` bytes at `virt`.
    ///
    /// The range must be completely mapped, otherwise nothing is changed and [`PagingError::NotMapped`] names the
    /// first absent address.
    /// Tables that become empty are returned to `pool`.
    pub fn destroy(
        &mut self,
        pool: &impl PageAllocator,
        virt: VAddr,
        size: u64,
        coherency: Coherency,
    ) -> Result<(), PagingError> {
        let size = self.aligned_size(virt, size)?;
        if size == 0 {
            return Ok(());
        }
        self.check_input_range(virt, size)?;

        let end = virt + size;
        let mut addr = virt;
        while addr < end {
            let leaf = self.lookup(addr).ok_or(PagingError::NotMapped { addr })?;
            addr = leaf.base + leaf.size;
        }

        log::trace!(
            "unmapping {virt:#x}..{end:#x} in tables at {:#x}",
            self.root_phys()
        );
        self.unmap_range(
            pool,
            self.root,
            self.format.start_level,
            virt,
            end,
            coherency,
        )
    }

    /// Translate `virt` by walking the tables in software
    pub fn lookup(&self, virt: VAddr) -> Option<Leaf> {
        if virt >= self.format.input_limit() {
            return None;
        }

        let mut table = self.root;
        let mut level = self.format.start_level;
        loop {
            let entry = unsafe { &*table.as_ptr().add(self.format.index(level, virt)) };
            if !entry.is_valid() {
                return None;
            }
            if entry.is_leaf(level) {
                let size = level_size(level);
                let base = virt & !(size - 1);
                return Some(Leaf {
                    phys: entry.output_addr() + (virt - base),
                    attrs: entry.attributes(),
                    level,
                    base,
                    size,
                });
            }
            table = self.table_at(entry.output_addr());
            level += 1;
        }
    }

    /// Translate `virt` if it is mapped with at least the attribute bits in `required`
    pub fn virt2phys(&self, virt: VAddr, required: u64) -> Option<PAddr> {
        self.lookup(virt)
            .filter(|leaf| leaf.attrs & required == required)
            .map(|leaf| leaf.phys)
    }

    /// Return all tables, including the root, to `pool`
    pub fn free(self, pool: &impl PageAllocator) {
        log::debug!("freeing translation tables at {:#x}", self.root_phys());
        self.free_table(
            pool,
            self.root_phys(),
            self.format.start_level,
            self.format.root_pages,
        );
    }

    /// `size` rounded up to whole pages, a length that cannot be rounded lies outside every format
    fn aligned_size(&self, virt: VAddr, size: u64) -> Result<u64, PagingError> {
        match size.checked_add(PAGE_OFFSET_MASK) {
            Some(end) => Ok(page_align_down(end)),
            None => Err(PagingError::AddressOutOfRange {
                addr: virt,
                bits: self.format.input_bits(),
            }),
        }
    }

    fn check_input_range(&self, virt: VAddr, size: u64) -> Result<(), PagingError> {
        if !is_page_aligned(virt) {
            return Err(PagingError::Misaligned { addr: virt });
        }
        let limit = self.format.input_limit();
        if virt >= limit || size > limit - virt {
            return Err(PagingError::AddressOutOfRange {
                addr: virt,
                bits: self.format.input_bits(),
            });
        }
        Ok(())
    }

    fn table_at(&self, phys: PAddr) -> NonNull<PageTableEntry> {
        let virt = self.phys_map.phys_to_virt(phys) as *mut PageTableEntry;
        // Safety: tables are allocated from the pool which never hands out address 0
        unsafe { NonNull::new_unchecked(virt) }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_range(
        &mut self,
        pool: &impl PageAllocator,
        table: NonNull<PageTableEntry>,
        level: usize,
        mut virt: VAddr,
        end: VAddr,
        mut phys: PAddr,
        attrs: u64,
        coherency: Coherency,
    ) -> Result<(), PagingError> {
        let entry_size = level_size(level);
        while virt < end {
            let entry_end = (virt & !(entry_size - 1)) + entry_size;
            let chunk_end = entry_end.min(end);
            let entry = unsafe { &mut *table.as_ptr().add(self.format.index(level, virt)) };

            let fits_leaf = level == 3
                || (level >= 1
                    && virt & (entry_size - 1) == 0
                    && phys & (entry_size - 1) == 0
                    && chunk_end == entry_end);

            if fits_leaf {
                let replaced_table = entry.is_table(level).then(|| entry.output_addr());
                unsafe { entry.set_leaf(phys, attrs, level) };
                flush_entries(entry, 1, coherency);
                if let Some(old) = replaced_table {
                    self.free_table(pool, old, level + 1, 1);
                }
            } else {
                let next = self.next_table(pool, entry, level, coherency)?;
                self.map_range(
                    pool,
                    next,
                    level + 1,
                    virt,
                    chunk_end,
                    phys,
                    attrs,
                    coherency,
                )?;
            }

            phys += chunk_end - virt;
            virt = chunk_end;
        }
        Ok(())
    }

    fn unmap_range(
        &mut self,
        pool: &impl PageAllocator,
        table: NonNull<PageTableEntry>,
        level: usize,
        mut virt: VAddr,
        end: VAddr,
        coherency: Coherency,
    ) -> Result<(), PagingError> {
        let entry_size = level_size(level);
        while virt < end {
            let entry_start = virt & !(entry_size - 1);
            let chunk_end = (entry_start + entry_size).min(end);
            let entry = unsafe { &mut *table.as_ptr().add(self.format.index(level, virt)) };

            if entry.is_leaf(level) && virt == entry_start && chunk_end == entry_start + entry_size {
                unsafe { entry.clear() };
                flush_entries(entry, 1, coherency);
            } else if entry.is_valid() {
                let next = self.next_table(pool, entry, level, coherency)?;
                self.unmap_range(pool, next, level + 1, virt, chunk_end, coherency)?;
                if unsafe { next.cast::<PageTable>().as_ref() }.is_empty() {
                    unsafe { entry.clear() };
                    flush_entries(entry, 1, coherency);
                    unsafe { pool.free(next.cast(), 1) };
                }
            }

            virt = chunk_end;
        }
        Ok(())
    }

    /// Return the table `entry` points to, allocating an empty one or splitting a block into one if necessary
    fn next_table(
        &mut self,
        pool: &impl PageAllocator,
        entry: &mut PageTableEntry,
        level: usize,
        coherency: Coherency,
    ) -> Result<NonNull<PageTableEntry>, PagingError> {
        if entry.is_table(level) {
            return Ok(self.table_at(entry.output_addr()));
        }

        let page = pool.alloc(1, AllocInit::Uninitialized)?;
        let table = PageTable::init(page, 1).cast::<PageTableEntry>();

        if entry.is_leaf(level) {
            let base = entry.output_addr();
            let attrs = entry.attributes();
            let sub_size = level_size(level + 1);
            log::trace!("splitting level {level} block at {base:#x}");
            for i in 0..ENTRIES_PER_TABLE {
                unsafe {
                    (*table.as_ptr().add(i)).set_leaf(base + i as u64 * sub_size, attrs, level + 1)
                };
            }
        }

        flush_entries(table.as_ptr(), ENTRIES_PER_TABLE, coherency);
        unsafe { entry.set_table(self.phys_map.virt_to_phys(table.as_ptr() as u64)) };
        flush_entries(entry, 1, coherency);
        Ok(table)
    }

    fn free_table(&self, pool: &impl PageAllocator, table_phys: PAddr, level: usize, pages: usize) {
        let table = self.table_at(table_phys);
        for i in 0..ENTRIES_PER_TABLE * pages {
            let entry = unsafe { &*table.as_ptr().add(i) };
            if entry.is_table(level) {
                self.free_table(pool, entry.output_addr(), level + 1, 1);
            }
        }
        unsafe { pool.free(table.cast(), pages) };
    }
}

impl Debug for PagingStructures {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PagingStructures")
            .field("root", &format_args!("{:#x}", self.root_phys()))
            .field("format", &self.format)
            .finish()
    }
}

fn flush_entries(entries: *const PageTableEntry, count: usize, coherency: Coherency) {
    if coherency == Coherency::Coherent {
        cache::clean_dcache_range(entries as usize, count * size_of::<PageTableEntry>());
    }
}
