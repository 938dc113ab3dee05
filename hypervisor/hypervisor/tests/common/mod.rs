use allocators::{PagePool, PoolPage, PAGE_SIZE};
use arm::barrier::Shareability;
use arm::cache::CacheOp;
use arm::cpu::Par;
use arm::mem::{PAddr, PhysMapping, VAddr};
use hypervisor::cpu::Cpu;
use std::cell::Cell;

/// A core on which stage-2 management can run, remembering only the last VTTBR_EL2 value
#[derive(Default)]
pub struct StageTwoCpu {
    pub vttbr: Cell<u64>,
}

unsafe impl Cpu for StageTwoCpu {
    fn write_vttbr(&self, value: u64) {
        self.vttbr.set(value);
    }
    fn write_vtcr(&self, _: u64) {}
    fn write_vbar(&self, _: u64) {}
    fn isb(&self) {}
    fn dsb(&self, _: Shareability) {}
    fn tlb_flush_guest(&self) {}
    fn icache_invalidate(&self) {}
    fn dcaches_flush(&self, _: CacheOp) {}
    fn hyp_stub_vectors(&self) -> u64 {
        unimplemented!("stage-2 tests never enter EL2")
    }
    fn translate_hyp(&self, _: VAddr) -> Par {
        unimplemented!("stage-2 tests never enter EL2")
    }
    unsafe fn elevate(&self, _: PAddr, _: PAddr, _: u64) {
        unimplemented!("stage-2 tests never enter EL2")
    }
    unsafe fn shutdown(&self, _: PAddr, _: PAddr, _: u64) -> ! {
        unimplemented!("stage-2 tests never leave EL2")
    }
    fn halt(&self) -> ! {
        panic!("core halted")
    }
}

pub fn with_pool<R>(pages: usize, f: impl FnOnce(&PagePool, PhysMapping) -> R) -> R {
    let mut mem = vec![PoolPage::zeroed(); pages];
    let virt = mem.as_ptr() as u64;
    let phys_map = PhysMapping::new(virt, 0x7c00_0000 | (virt & 0x1f_ffff), (pages * PAGE_SIZE) as u64);
    let pool = PagePool::new(&mut mem);
    f(&pool, phys_map)
}
