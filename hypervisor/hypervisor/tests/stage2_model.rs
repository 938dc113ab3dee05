//! Compares the stage-2 tables against a simple model under random sequences of region (un)mappings

mod common;

use common::{with_pool, StageTwoCpu};
use hypervisor::cell::{Cell, CpuSet};
use hypervisor::config::{MemFlags, MemoryRegion};
use hypervisor::mmu_cell::CellMmu;
use hypervisor::percpu::PerCpu;
use hypervisor::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GUEST_BASE: u64 = 0x4000_0000;
/// Number of pages of the modelled guest address space, spanning more than one 2 MiB block
const PAGES: u64 = 1024;
const PAGE: u64 = 0x1000;

/// Which region (phys base, flags) covers each guest page, if any
type Model = Vec<Option<(u64, MemFlags)>>;

fn random_region(rng: &mut StdRng) -> MemoryRegion {
    let first = rng.gen_range(0..PAGES);
    let pages = rng.gen_range(1..=(PAGES - first).min(600));
    // keep physical and guest addresses congruent modulo 2 MiB in half of the cases so that blocks are used
    let phys = match rng.gen_bool(0.5) {
        true => 0x8000_0000 + first * PAGE,
        false => 0x9000_0000 + rng.gen_range(0..0x100) * PAGE,
    };
    let flags = match rng.gen_range(0..3) {
        0 => MemFlags::READ,
        1 => MemFlags::READ | MemFlags::WRITE,
        _ => MemFlags::READ | MemFlags::WRITE | MemFlags::IO,
    };
    MemoryRegion::new(phys, GUEST_BASE + first * PAGE, pages * PAGE, flags)
}

fn check(mmu: &CellMmu<StageTwoCpu, allocators::PagePool>, core: &PerCpu, model: &Model) {
    for (page, expected) in model.iter().enumerate() {
        let addr = GUEST_BASE + page as u64 * PAGE + 0x18;
        match expected {
            None => assert_eq!(
                mmu.translate(core, addr, MemFlags::READ),
                Err(Error::TranslationFault { addr })
            ),
            Some((phys, flags)) => {
                let translation = mmu.translate(core, addr, MemFlags::READ).unwrap();
                assert_eq!(translation.phys, phys + 0x18, "page {page}");
                assert_eq!(
                    translation.granted & !MemFlags::EXECUTE,
                    *flags,
                    "page {page}"
                );
            }
        }
    }
}

#[test]
fn random_mappings_match_the_model() {
    let mut rng = StdRng::seed_from_u64(0x6a61_696c);

    with_pool(512, |pool, phys_map| {
        let cpu = StageTwoCpu::default();
        let mmu = CellMmu::new(&cpu, pool, phys_map);
        let baseline = pool.used_pages();
        let cell = Cell::new(1, CpuSet::from_cpus(&[0]), 0);
        mmu.init(&cell).unwrap();
        let mut core = PerCpu::new(0, 0);
        mmu.activate(&mut core, &cell).unwrap();

        let mut model: Model = vec![None; PAGES as usize];
        let mut mapped: Vec<MemoryRegion> = Vec::new();

        for _ in 0..200 {
            if !mapped.is_empty() && rng.gen_bool(0.3) {
                let region = mapped.swap_remove(rng.gen_range(0..mapped.len()));
                let first = ((region.virt_start - GUEST_BASE) / PAGE) as usize;
                let pages = (region.size / PAGE) as usize;
                let fully_mapped = model[first..first + pages].iter().all(Option::is_some);

                match mmu.unmap_region(&cell, &region) {
                    Ok(()) => {
                        assert!(fully_mapped);
                        model[first..first + pages].fill(None);
                    }
                    Err(Error::NotMapped { .. }) => assert!(!fully_mapped),
                    Err(e) => panic!("unexpected error {e}"),
                }
            } else {
                let region = random_region(&mut rng);
                mmu.map_region(&cell, &region).unwrap();
                let first = (region.virt_start - GUEST_BASE) / PAGE;
                for page in 0..region.size / PAGE {
                    model[(first + page) as usize] = Some((region.phys_start + page * PAGE, region.flags));
                }
                mapped.push(region);
            }
            check(&mmu, &core, &model);
        }

        mmu.deactivate(&mut core);
        drop(core);
        mmu.destroy(cell);
        assert_eq!(pool.used_pages(), baseline);
    });
}
