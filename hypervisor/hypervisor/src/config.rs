//! Descriptors of the static system configuration
//!
//! These are produced by configuration tooling outside of the hypervisor and only ever read here.
//! Their layout is shared with that tooling, hence `#[repr(C)]`.

use arm::mem::{PAddr, VAddr};
use bitflags::bitflags;
use static_assertions::const_assert_eq;

bitflags! {
    /// Access rights and properties of a [`MemoryRegion`]
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct MemFlags: u64 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        const DMA = 0x0008;
        const IO = 0x0010;
        /// The region is backed by the cell's communication page, whatever its physical start says
        const COMM_REGION = 0x0020;
        const LOADABLE = 0x0040;
        const ROOTSHARED = 0x0080;
    }
}

/// A piece of memory that is granted to a cell
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct MemoryRegion {
    pub phys_start: PAddr,
    /// Start of the region in the cell's guest-physical address space
    pub virt_start: VAddr,
    pub size: u64,
    pub flags: MemFlags,
}

const_assert_eq!(core::mem::size_of::<MemoryRegion>(), 32);

impl MemoryRegion {
    pub const fn new(phys_start: PAddr, virt_start: VAddr, size: u64, flags: MemFlags) -> Self {
        Self {
            phys_start,
            virt_start,
            size,
            flags,
        }
    }

    /// A region whose guest-physical addresses equal its physical ones
    pub const fn identity(start: PAddr, size: u64, flags: MemFlags) -> Self {
        Self::new(start, start, size, flags)
    }

    pub fn contains(&self, gphys: VAddr) -> bool {
        gphys.wrapping_sub(self.virt_start) < self.size
    }
}

/// Static description of a cell
#[derive(Debug, Copy, Clone)]
pub struct CellDesc<'a> {
    pub name: &'a str,
    pub id: u32,
    /// Bitmap of the cores assigned to the cell
    pub cpu_set: u64,
    pub mem_regions: &'a [MemoryRegion],
}

/// Description of the platform the hypervisor runs on
#[derive(Debug, Copy, Clone)]
pub struct SystemConfig<'a> {
    /// Memory reserved for the hypervisor image and its page pool
    pub hypervisor_memory: MemoryRegion,
    /// Register block of the UART used for log output
    pub debug_console: MemoryRegion,
    pub root_cell: CellDesc<'a>,
}
