use super::addr::{level_size, PAddr, OUTPUT_ADDR_MASK, PAGE_OFFSET_MASK};
use crate::mem::PAGESIZE;
use bitflags::bitflags;
use core::fmt::{Binary, Debug, Formatter, LowerHex, UpperHex};

/// An entry of a [`PageTable`](super::PageTable) in the VMSAv8-64 descriptor format with a 4 KiB granule.
///
/// # Format
/// - Bit 0 marks the descriptor valid.
/// - Bit 1 distinguishes table (1) from block (0) descriptors at levels 0 to 2.
///   At level 3 it must be set for a valid page descriptor.
/// - Bits 47–12 hold the output address (next level table, block or page).
/// - Bits 11–2 and 63–52 are the lower and upper attributes of block and page descriptors.
///   Their meaning differs between stage-1 ([`Stage1Flags`]) and stage-2 ([`Stage2Flags`]) tables.
///
/// ```text
///  63      52 51    48 47                          12 11            2   1   0
/// ┌──────────┬────────┬──────────────────────────────┬───────────────┬───┬───┐
/// │ upper    │  res0  │        output address        │ lower attrs   │ T │ V │
/// └──────────┴────────┴──────────────────────────────┴───────────────┴───┴───┘
/// ```
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C, align(8))]
pub struct PageTableEntry {
    pub(crate) entry: u64,
}

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE_OR_PAGE: u64 = 1 << 1;

/// The attribute bits of block and page descriptors
pub const ATTR_MASK: u64 = 0xfff0_0000_0000_0ffc;

impl PageTableEntry {
    /// Create a new empty entry.
    ///
    /// This entry does not point to anything and is considered disabled by the hardware.
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    /// Whether this entry is currently valid (in other words whether it is considered active)
    pub fn is_valid(&self) -> bool {
        self.entry & DESC_VALID != 0
    }

    /// Whether this entry points to a table of the next level when found in a table at `level`
    pub fn is_table(&self, level: usize) -> bool {
        self.is_valid() && level < 3 && self.entry & DESC_TABLE_OR_PAGE != 0
    }

    /// Whether this is a leaf entry (block or page) not pointing to further tables when found in a table at
    /// `level`.
    pub fn is_leaf(&self, level: usize) -> bool {
        self.is_valid() && !self.is_table(level)
    }

    /// Return the attribute bits encoded in this entry
    pub fn attributes(&self) -> u64 {
        self.entry & ATTR_MASK
    }

    /// Return the address which this entry points to
    pub fn get_addr(&self) -> Result<PAddr, EntryInvalidErr> {
        match self.is_valid() {
            false => Err(EntryInvalidErr),
            true => Ok(self.entry & OUTPUT_ADDR_MASK),
        }
    }

    /// The output address bits, without checking whether the entry is valid
    pub fn output_addr(&self) -> PAddr {
        self.entry & OUTPUT_ADDR_MASK
    }

    /// Make this entry point to the next level table at `table`.
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn set_table(&mut self, table: PAddr) {
        assert_eq!(
            table & PAGE_OFFSET_MASK,
            0,
            "cannot point a table descriptor to unaligned PAddr {table:#x}"
        );
        log::trace!("setting {:?} to table {:#x}", self.location(), table);
        self.entry = (table & OUTPUT_ADDR_MASK) | DESC_TABLE_OR_PAGE | DESC_VALID;
    }

    /// Make this entry a block (levels 1 and 2) or page (level 3) descriptor for `addr` with the given attribute
    /// bits.
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn set_leaf(&mut self, addr: PAddr, attrs: u64, level: usize) {
        assert!(
            (1..=3).contains(&level),
            "no block descriptors are possible at level {level}"
        );
        assert_eq!(
            addr & (level_size(level) - 1),
            0,
            "cannot map unaligned PAddr {addr:#x} at level {level}"
        );
        log::trace!(
            "setting {:?} to {:#x} with attributes {:#x}",
            self.location(),
            addr,
            attrs
        );

        let kind = if level == 3 { DESC_TABLE_OR_PAGE } else { 0 };
        self.entry = (addr & OUTPUT_ADDR_MASK) | (attrs & ATTR_MASK) | kind | DESC_VALID;
    }

    /// Clear the content of this entry, setting it to 0x0 and removing all flags.
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn clear(&mut self) {
        log::trace!("clearing {:?}", self.location());
        self.entry = 0;
    }

    fn location(&self) -> EntryLocation {
        let addr = self as *const Self as usize;
        EntryLocation {
            table: addr & !(PAGESIZE - 1),
            index: (addr & (PAGESIZE - 1)) / core::mem::size_of::<Self>(),
        }
    }
}

struct EntryLocation {
    table: usize,
    index: usize,
}

impl Debug for EntryLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "page table entry {:#x}:{:03}", self.table, self.index)
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let location = self.location();
        match self.get_addr() {
            Err(_) => f.write_fmt(format_args!(
                "PageTableEntry {:#x}:{:03} (invalid) {{ .. }}",
                location.table, location.index
            )),
            Ok(addr) => f.write_fmt(format_args!(
                "PageTableEntry {:#x}:{:03} {{ addr: {:12x}, attrs: {:#x}, table_or_page: {} }}",
                location.table,
                location.index,
                addr,
                self.attributes(),
                self.entry & DESC_TABLE_OR_PAGE != 0,
            )),
        }
    }
}

impl Binary for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.entry, f)
    }
}

impl LowerHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.entry, f)
    }
}

impl UpperHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.entry, f)
    }
}

bitflags! {
    /// Attributes of block and page descriptors in the hypervisor's own (EL2 stage-1) translation tables
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Stage1Flags: u64 {
        /// AttrIndx = 1: use the device nGnRE attribute of MAIR_EL2 instead of normal memory
        const Device = 1 << 2;
        /// AP[1], RES1 in the EL2 translation regime
        const ApRes1 = 1 << 6;
        /// AP[2]: writes are not permitted
        const ReadOnly = 1 << 7;
        /// Inner shareable
        const InnerShareable = 0b11 << 8;
        /// Access flag. Accesses through an entry without it fault.
        const Accessed = 1 << 10;
        /// Instructions may not be fetched from the mapping
        const ExecuteNever = 1 << 54;
    }
}

impl Stage1Flags {
    /// Flags for normal hypervisor memory: readable, writable, executable and cacheable
    pub const DEFAULT: Self = Self::ApRes1
        .union(Self::InnerShareable)
        .union(Self::Accessed);

    /// Flags for memory mapped devices
    pub const DEVICE: Self = Self::DEFAULT
        .union(Self::Device)
        .union(Self::ExecuteNever);
}

bitflags! {
    /// Attributes of block and page descriptors in the stage-2 tables of a cell
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Stage2Flags: u64 {
        /// The MemAttr field, see [`S2MemAttr`]
        const MemAttr = 0b1111 << 2;
        /// S2AP[0]: the cell may read
        const Read = 1 << 6;
        /// S2AP[1]: the cell may write
        const Write = 1 << 7;
        /// Inner shareable
        const InnerShareable = 0b11 << 8;
        /// Access flag. Accesses through an entry without it fault.
        const Accessed = 1 << 10;
        /// The cell may not fetch instructions from the mapping
        const ExecuteNever = 1 << 54;
    }
}

/// Memory types selectable through the MemAttr field of stage-2 descriptors
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum S2MemAttr {
    /// Device nGnRE
    Device = 0b0001,
    /// Normal memory, inner and outer write-back cacheable
    Normal = 0b1111,
}

impl Stage2Flags {
    /// Replace the MemAttr field
    pub const fn with_mem_attr(self, attr: S2MemAttr) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MemAttr.bits()) | ((attr as u64) << 2))
    }

    /// Decode the MemAttr field
    pub fn mem_attr(&self) -> Option<S2MemAttr> {
        match (self.bits() & Self::MemAttr.bits()) >> 2 {
            0b0001 => Some(S2MemAttr::Device),
            0b1111 => Some(S2MemAttr::Normal),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct EntryInvalidErr;
