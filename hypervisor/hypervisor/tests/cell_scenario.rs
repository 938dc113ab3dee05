mod common;

use allocators::{AllocInit, PageAllocator};
use arm::mem::VAddr;
use common::{with_pool, StageTwoCpu};
use hypervisor::cell::{Cell, CpuSet};
use hypervisor::config::{CellDesc, MemFlags, MemoryRegion};
use hypervisor::mmu_cell::CellMmu;
use hypervisor::percpu::PerCpu;
use hypervisor::Error;

const REGIONS: [MemoryRegion; 3] = [
    MemoryRegion::identity(0x4000_0000, 0x1000, MemFlags::READ.union(MemFlags::WRITE)),
    MemoryRegion::new(
        0x1c2_8000,
        0x0900_0000,
        0x1000,
        MemFlags::READ.union(MemFlags::WRITE).union(MemFlags::IO),
    ),
    // the physical start of a communication region is never used
    MemoryRegion::new(
        0xdead_beef_0000,
        0x8000_0000,
        0x1000,
        MemFlags::READ.union(MemFlags::WRITE).union(MemFlags::COMM_REGION),
    ),
];

const DESC: CellDesc = CellDesc {
    name: "linux-demo",
    id: 5,
    cpu_set: 0b1100,
    mem_regions: &REGIONS,
};

#[test]
fn cell_lifecycle() {
    with_pool(64, |pool, phys_map| {
        let cpu = StageTwoCpu::default();
        let mmu = CellMmu::new(&cpu, pool, phys_map);
        let baseline = pool.used_pages();

        let comm_page = pool.alloc(1, AllocInit::Zeroed).unwrap();
        let cell = Cell::from_desc(&DESC, comm_page.as_ptr() as VAddr);
        assert_eq!(cell.cpu_set, CpuSet::from_cpus(&[2, 3]));
        mmu.init(&cell).unwrap();
        for region in DESC.mem_regions {
            mmu.map_region(&cell, region).unwrap();
        }

        for cpu_id in [2, 3] {
            let mut core = PerCpu::new(cpu_id, 0);
            mmu.activate(&mut core, &cell).unwrap();
            assert_eq!(cpu.vttbr.get() >> 48, 5);

            let read = mmu.translate(&core, 0x4000_0000, MemFlags::READ).unwrap();
            assert_eq!(read.phys, 0x4000_0000);
            let write = mmu.translate(&core, 0x4000_0000, MemFlags::WRITE).unwrap();
            assert_eq!(write.phys, 0x4000_0000);
            assert_eq!(
                mmu.translate(&core, 0x4000_1000, MemFlags::READ),
                Err(Error::TranslationFault { addr: 0x4000_1000 })
            );

            let uart = mmu.translate(&core, 0x0900_0004, MemFlags::WRITE).unwrap();
            assert_eq!(uart.phys, 0x1c2_8004);
            assert!(uart.granted.contains(MemFlags::IO));

            let comm = mmu.translate(&core, 0x8000_0000, MemFlags::READ).unwrap();
            assert_eq!(comm.phys, phys_map.virt_to_phys(cell.comm_page));

            mmu.deactivate(&mut core);
        }

        for region in DESC.mem_regions {
            mmu.unmap_region(&cell, region).unwrap();
        }
        mmu.destroy(cell);
        unsafe { pool.free(comm_page, 1) };
        assert_eq!(pool.used_pages(), baseline);
    });
}

#[test]
fn activating_an_uninitialized_cell_fails() {
    with_pool(16, |pool, phys_map| {
        let cpu = StageTwoCpu::default();
        let mmu = CellMmu::new(&cpu, pool, phys_map);
        let cell = Cell::new(9, CpuSet::from_cpus(&[0]), 0);
        let mut core = PerCpu::new(0, 0);
        assert_eq!(
            mmu.activate(&mut core, &cell),
            Err(Error::CellUninitialized { id: 9 })
        );
        assert!(core.cell().is_none());
    });
}
