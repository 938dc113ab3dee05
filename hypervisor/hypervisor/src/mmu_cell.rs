//! Stage-2 address translation of cells
//!
//! Every cell owns a set of stage-2 tables that translate its intermediate physical (guest physical) addresses to
//! physical ones.
//! They only ever contain the memory regions that were explicitly mapped into the cell.

use crate::caches;
use crate::cell::Cell;
use crate::config::{MemFlags, MemoryRegion};
use crate::cpu::Cpu;
use crate::errors::Error;
use crate::percpu::PerCpu;
use allocators::PageAllocator;
use arm::cpu::{vttbr, VTCR_CELL};
use arm::mem::{
    Coherency, PAddr, PagingStructures, PhysMapping, S2MemAttr, Stage2Flags, VAddr, CELL_PAGING,
    PAGESIZE,
};

/// Number of concatenated pages that form the root table of a cell
pub const CELL_ROOT_PT_PAGES: usize = CELL_PAGING.root_pages;

/// Largest cell id that is usable as VMID
pub const MAX_CELL_ID: u32 = 0xff;

/// The outcome of a successful stage-2 translation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub phys: PAddr,
    /// The access rights the cell has on the page, expressed as [`MemFlags::READ`], [`MemFlags::WRITE`],
    /// [`MemFlags::EXECUTE`] and [`MemFlags::IO`]
    pub granted: MemFlags,
}

/// Manager of the stage-2 tables of all cells
pub struct CellMmu<'a, C: Cpu, A: PageAllocator> {
    cpu: &'a C,
    pool: &'a A,
    /// Where the hypervisor sees its own memory, which includes the communication pages of cells
    phys_map: PhysMapping,
}

impl<'a, C: Cpu, A: PageAllocator> CellMmu<'a, C, A> {
    pub fn new(cpu: &'a C, pool: &'a A, phys_map: PhysMapping) -> Self {
        Self {
            cpu,
            pool,
            phys_map,
        }
    }

    /// Allocate the (empty) stage-2 root table of `cell`
    pub fn init(&self, cell: &Cell) -> Result<(), Error> {
        if cell.id > MAX_CELL_ID {
            log::error!("cell id {} exceeds the VMID space", cell.id);
            return Err(Error::CellIdOverflow { id: cell.id });
        }

        let mut stage2 = cell.stage2.spin_lock();
        assert!(
            stage2.is_none(),
            "stage-2 tables of cell {} are already initialized",
            cell.id
        );
        let paging = PagingStructures::new(self.pool, CELL_PAGING, self.phys_map)?;
        log::debug!(
            "cell {} uses stage-2 tables at {:#x}",
            cell.id,
            paging.root_phys()
        );
        *stage2 = Some(paging);
        Ok(())
    }

    /// Return all stage-2 tables of `cell` to the page pool
    pub fn destroy(&self, cell: Cell) {
        if let Some(paging) = cell.stage2.into_inner() {
            log::debug!("destroying stage-2 tables of cell {}", cell.id);
            paging.free(self.pool);
        }
    }

    /// Grant `cell` access to `region`.
    ///
    /// Communication regions are always backed by the cell's communication page.
    pub fn map_region(&self, cell: &Cell, region: &MemoryRegion) -> Result<(), Error> {
        let phys = match region.flags.contains(MemFlags::COMM_REGION) {
            true => {
                if region.size > PAGESIZE as u64 {
                    log::warn!(
                        "cell {}: communication region of {:#x} bytes exposes the pages following its comm page",
                        cell.id,
                        region.size
                    );
                }
                self.phys_map.virt_to_phys(cell.comm_page)
            }
            false => region.phys_start,
        };
        let attrs = stage2_attributes(region.flags);

        log::trace!(
            "cell {}: mapping {:#x} (+{:#x}) -> {phys:#x} ({:?})",
            cell.id,
            region.virt_start,
            region.size,
            region.flags
        );
        let mut stage2 = cell.stage2.spin_lock();
        let paging = stage2
            .as_mut()
            .ok_or(Error::CellUninitialized { id: cell.id })?;
        paging.create(
            self.pool,
            phys,
            region.size,
            region.virt_start,
            attrs.bits(),
            Coherency::Coherent,
        )?;
        Ok(())
    }

    /// Revoke the access of `cell` to `region`.
    ///
    /// The whole region must currently be mapped, otherwise [`Error::NotMapped`] is returned and nothing changes.
    pub fn unmap_region(&self, cell: &Cell, region: &MemoryRegion) -> Result<(), Error> {
        log::trace!(
            "cell {}: unmapping {:#x} (+{:#x})",
            cell.id,
            region.virt_start,
            region.size
        );
        let mut stage2 = cell.stage2.spin_lock();
        let paging = stage2
            .as_mut()
            .ok_or(Error::CellUninitialized { id: cell.id })?;
        paging.destroy(
            self.pool,
            region.virt_start,
            region.size,
            Coherency::Coherent,
        )?;
        Ok(())
    }

    /// Translate the guest physical address `gphys` for an `access` by the cell activated on `core`
    pub fn translate(
        &self,
        core: &PerCpu<'_>,
        gphys: VAddr,
        access: MemFlags,
    ) -> Result<Translation, Error> {
        let fault = Error::TranslationFault { addr: gphys };
        let cell = core.cell.ok_or(fault)?;
        let stage2 = cell.stage2.spin_lock();
        let leaf = stage2
            .as_ref()
            .and_then(|paging| paging.lookup(gphys))
            .ok_or(fault)?;

        let granted = granted_access(leaf.attrs);
        let requested = access & (MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE);
        if !granted.contains(requested) {
            log::debug!(
                "cell {}: {requested:?} access to {gphys:#x} denied, only {granted:?} granted",
                cell.id
            );
            return Err(fault);
        }
        Ok(Translation {
            phys: leaf.phys,
            granted,
        })
    }

    /// Translate `gphys` in the cell activated on `core` if it is mapped with at least the rights in `flags`
    pub fn gphys2phys(&self, core: &PerCpu<'_>, gphys: VAddr, flags: MemFlags) -> Option<PAddr> {
        let mut required = Stage2Flags::empty();
        required.set(Stage2Flags::Read, flags.contains(MemFlags::READ));
        required.set(Stage2Flags::Write, flags.contains(MemFlags::WRITE));

        let stage2 = core.cell?.stage2.spin_lock();
        let phys = stage2.as_ref()?.virt2phys(gphys, required.bits());
        phys
    }

    /// Switch `core` to the stage-2 tables and VMID of `cell`
    pub fn activate<'c>(&self, core: &mut PerCpu<'c>, cell: &'c Cell) -> Result<(), Error> {
        assert!(
            cell.cpu_set.contains(core.cpu_id),
            "cpu {} does not belong to cell {}",
            core.cpu_id,
            cell.id
        );
        let root = cell
            .stage2_root()
            .ok_or(Error::CellUninitialized { id: cell.id })?;

        log::debug!("cpu {}: activating cell {}", core.cpu_id, cell.id);
        self.cpu.write_vttbr(vttbr(cell.vmid(), root));
        self.cpu.write_vtcr(VTCR_CELL);
        caches::activate_sync(self.cpu);

        core.cell = Some(cell);
        Ok(())
    }

    /// Drop the reference of `core` to the cell activated on it
    pub fn deactivate(&self, core: &mut PerCpu<'_>) {
        core.cell = None;
    }

    /// Make memory contents of `cell` visible under its new mappings.
    ///
    /// The data caches are cleaned on the next guest entry of `core`, see [`on_guest_entry()`](Self::on_guest_entry).
    /// The instruction cache is invalidated right away because it may hold aliases of any VMID.
    pub fn flush_caches(&self, core: &mut PerCpu<'_>, cell: &Cell) {
        log::trace!("cpu {}: flushing caches for cell {}", core.cpu_id, cell.id);
        core.flush_dcache = true;
        caches::icache_flush(self.cpu);
    }

    /// Perform the data cache maintenance that was deferred for `core`
    pub fn on_guest_entry(&self, core: &mut PerCpu<'_>) {
        if core.flush_dcache {
            caches::dcaches_flush(self.cpu, caches::CacheOp::CleanAndInvalidate);
            core.flush_dcache = false;
        }
    }
}

/// Stage-2 descriptor attributes for a region with `flags`
pub fn stage2_attributes(flags: MemFlags) -> Stage2Flags {
    let mut attrs = Stage2Flags::Accessed;
    if flags.contains(MemFlags::READ) {
        attrs |= Stage2Flags::Read;
    }
    if flags.contains(MemFlags::WRITE) {
        attrs |= Stage2Flags::Write;
    }
    if flags.contains(MemFlags::IO) {
        attrs = attrs.with_mem_attr(S2MemAttr::Device);
    } else {
        attrs = (attrs | Stage2Flags::InnerShareable).with_mem_attr(S2MemAttr::Normal);
    }
    // TODO: set ExecuteNever for regions without MemFlags::EXECUTE once every cell configuration marks its code
    attrs
}

fn granted_access(attrs: u64) -> MemFlags {
    let attrs = Stage2Flags::from_bits_retain(attrs);
    let mut granted = MemFlags::empty();
    granted.set(MemFlags::READ, attrs.contains(Stage2Flags::Read));
    granted.set(MemFlags::WRITE, attrs.contains(Stage2Flags::Write));
    granted.set(MemFlags::EXECUTE, !attrs.contains(Stage2Flags::ExecuteNever));
    granted.set(MemFlags::IO, attrs.mem_attr() == Some(S2MemAttr::Device));
    granted
}
