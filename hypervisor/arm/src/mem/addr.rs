/// Type alias for physical addresses.
///
/// This is used by functions that explicitly interpret addresses as physical ones.
/// For stage-2 tables the "virtual" side is the guest-physical address space of a cell.
pub type PAddr = u64;

/// Type alias for virtual addresses.
pub type VAddr = u64;

pub const PAGE_OFFSET_BITS: u64 = 12;
pub const PAGE_OFFSET_MASK: u64 = (1 << PAGE_OFFSET_BITS) - 1;

/// Number of input address bits resolved by one table level
pub const INDEX_BITS: u64 = 9;

/// Bits of a descriptor (or of PAR_EL1) that hold an output address
pub const OUTPUT_ADDR_MASK: u64 = ((1 << 48) - 1) & !PAGE_OFFSET_MASK;

/// The lowest input address bit that selects an entry of a table at `level`
#[inline]
pub const fn level_shift(level: usize) -> u64 {
    PAGE_OFFSET_BITS + INDEX_BITS * (3 - level as u64)
}

/// Number of bytes covered by one entry of a table at `level`
#[inline]
pub const fn level_size(level: usize) -> u64 {
    1 << level_shift(level)
}

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !PAGE_OFFSET_MASK
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    page_align_down(addr + PAGE_OFFSET_MASK)
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

/// Get the page offset from an address
#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & PAGE_OFFSET_MASK
}
