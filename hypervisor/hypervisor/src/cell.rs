use crate::config::CellDesc;
use arm::mem::{PagingStructures, VAddr};
use core::fmt::{Debug, Formatter};
use ksync::SpinLock;

/// The set of cores assigned to a cell
#[derive(Default, Copy, Clone, Eq, PartialEq)]
pub struct CpuSet(pub u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_cpus(cpus: &[usize]) -> Self {
        cpus.iter().fold(Self::empty(), |set, &cpu| set.with(cpu))
    }

    pub const fn with(self, cpu: usize) -> Self {
        assert!(cpu < 64);
        Self(self.0 | 1 << cpu)
    }

    pub const fn contains(&self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(|&cpu| self.contains(cpu))
    }
}

impl Debug for CpuSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A partition of the system.
///
/// The stage-2 tables are created by [`CellMmu::init()`](crate::mmu_cell::CellMmu::init) and torn down by
/// [`CellMmu::destroy()`](crate::mmu_cell::CellMmu::destroy) which consumes the cell.
/// Cores reference the cell they run while it is activated on them, so a cell cannot be destroyed before every
/// core has let go of it.
pub struct Cell {
    pub id: u32,
    pub cpu_set: CpuSet,
    /// Hypervisor virtual address of the page backing the cell's communication region
    pub comm_page: VAddr,
    pub(crate) stage2: SpinLock<Option<PagingStructures>>,
}

impl Cell {
    pub const fn new(id: u32, cpu_set: CpuSet, comm_page: VAddr) -> Self {
        Self {
            id,
            cpu_set,
            comm_page,
            stage2: SpinLock::new(None),
        }
    }

    pub fn from_desc(desc: &CellDesc, comm_page: VAddr) -> Self {
        Self::new(desc.id, CpuSet(desc.cpu_set), comm_page)
    }

    /// The VMID that translations of this cell are tagged with
    pub fn vmid(&self) -> u8 {
        self.id as u8
    }

    /// Physical address of the stage-2 root table, if the tables exist
    pub fn stage2_root(&self) -> Option<u64> {
        self.stage2.spin_lock().as_ref().map(PagingStructures::root_phys)
    }
}

impl Debug for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("cpu_set", &self.cpu_set)
            .field("comm_page", &format_args!("{:#x}", self.comm_page))
            .finish()
    }
}
