//! The hardware the core logic operates on
//!
//! Everything that touches system registers, caches, TLBs or changes the exception level goes through [`Cpu`].
//! On AArch64 it is implemented by [`Aarch64Cpu`]; tests substitute a recording implementation.

use arm::barrier::Shareability;
use arm::cache::CacheOp;
use arm::cpu::Par;
use arm::mem::{PAddr, VAddr};

/// Operations on the executing core.
///
/// # Safety
/// Implementations must perform exactly the documented architectural effect on the core that calls them.
/// The translation and exception level logic relies on that for memory safety.
pub unsafe trait Cpu {
    fn write_vttbr(&self, value: u64);
    fn write_vtcr(&self, value: u64);
    fn write_vbar(&self, value: u64);

    fn isb(&self);
    fn dsb(&self, domain: Shareability);

    /// Invalidate stage-1 and stage-2 TLB entries of the current VMID
    fn tlb_flush_guest(&self);
    /// Invalidate the complete instruction cache
    fn icache_invalidate(&self);
    /// Apply `op` to all data caches up to the point of coherency
    fn dcaches_flush(&self, op: CacheOp);

    /// The vector base that the hyp stub of the host kernel reports
    fn hyp_stub_vectors(&self) -> u64;

    /// Translate a hypervisor virtual address with the EL2 stage-1 tables currently in use (`AT S1E2R`)
    fn translate_hyp(&self, vaddr: VAddr) -> Par;

    /// Move the core from EL1 to EL2, see [`arm_elevate`](arm::asm_utils).
    ///
    /// # Safety
    /// The trampoline and the current stack page must be identity mapped in the tables `setup` refers to, and the
    /// data caches must be clean.
    unsafe fn elevate(&self, bootstrap_vectors: PAddr, setup: PAddr, phys2virt_offset: u64);

    /// Jump to the physical alias of the shutdown routine which returns to EL1 with the context at `regs`
    ///
    /// # Safety
    /// The routine and the current stack page must be identity mapped.
    unsafe fn shutdown(&self, routine: PAddr, regs: PAddr, vectors: u64) -> !;

    /// Stop the core forever
    fn halt(&self) -> !;
}

#[cfg(target_arch = "aarch64")]
pub use aarch64::Aarch64Cpu;

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use super::Cpu;
    use arm::asm_utils::arm_elevate;
    use arm::barrier::{self, Shareability};
    use arm::cache::{self, CacheOp};
    use arm::cpu::{at_s1e2r, Par, VbarEl2, VtcrEl2, VttbrEl2};
    use arm::mem::{PAddr, VAddr};
    use arm::{hyp_stub, tlb, utils};

    /// The core this code is executing on
    #[derive(Debug, Default)]
    pub struct Aarch64Cpu;

    unsafe impl Cpu for Aarch64Cpu {
        fn write_vttbr(&self, value: u64) {
            unsafe { VttbrEl2::write_raw(value) }
        }

        fn write_vtcr(&self, value: u64) {
            unsafe { VtcrEl2::write_raw(value) }
        }

        fn write_vbar(&self, value: u64) {
            unsafe { VbarEl2::write_raw(value) }
        }

        fn isb(&self) {
            barrier::isb()
        }

        fn dsb(&self, domain: Shareability) {
            barrier::dsb(domain)
        }

        fn tlb_flush_guest(&self) {
            tlb::flush_guest()
        }

        fn icache_invalidate(&self) {
            cache::icache_invalidate_all()
        }

        fn dcaches_flush(&self, op: CacheOp) {
            cache::dcaches_flush(op)
        }

        fn hyp_stub_vectors(&self) -> u64 {
            hyp_stub::get_vectors()
        }

        fn translate_hyp(&self, vaddr: VAddr) -> Par {
            at_s1e2r(vaddr)
        }

        unsafe fn elevate(&self, bootstrap_vectors: PAddr, setup: PAddr, phys2virt_offset: u64) {
            arm_elevate(bootstrap_vectors, setup, phys2virt_offset)
        }

        unsafe fn shutdown(&self, routine: PAddr, regs: PAddr, vectors: u64) -> ! {
            let routine: extern "C" fn(PAddr, u64) -> ! = core::mem::transmute(routine as usize);
            routine(regs, vectors)
        }

        fn halt(&self) -> ! {
            utils::wfe_spin()
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    extern crate std;

    use super::Cpu;
    use arm::asm_utils::El2Setup;
    use arm::barrier::Shareability;
    use arm::cache::CacheOp;
    use arm::cpu::Par;
    use arm::mem::{PAddr, PagingStructures, PhysMapping, VAddr, HYP_PAGING};
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum CpuOp {
        WriteVttbr(u64),
        WriteVtcr(u64),
        WriteVbar(u64),
        Isb,
        Dsb(Shareability),
        TlbFlushGuest,
        ICacheInvalidate,
        DCachesFlush(CacheOp),
        GetVectors,
        Elevate {
            bootstrap_vectors: PAddr,
            setup: El2Setup,
            phys2virt_offset: u64,
            /// Whether the bootstrap vectors were identity mapped in the tables of `setup`
            bootstrap_mapped: bool,
        },
        TranslateHyp(VAddr),
        Shutdown {
            routine: PAddr,
            regs: PAddr,
            vectors: u64,
        },
    }

    /// A core that records every operation instead of executing it.
    ///
    /// Address translation at EL2 is emulated by walking the tables that were handed to [`Cpu::elevate()`].
    pub struct MockCpu {
        phys_map: PhysMapping,
        stub_vectors: u64,
        ops: RefCell<Vec<CpuOp>>,
        ttbr: Cell<Option<PAddr>>,
        forced_par: Cell<Option<Par>>,
    }

    impl MockCpu {
        pub fn new(phys_map: PhysMapping, stub_vectors: u64) -> Self {
            Self {
                phys_map,
                stub_vectors,
                ops: RefCell::new(Vec::new()),
                ttbr: Cell::new(None),
                forced_par: Cell::new(None),
            }
        }

        pub fn ops(&self) -> Vec<CpuOp> {
            self.ops.borrow().clone()
        }

        pub fn clear(&self) {
            self.ops.borrow_mut().clear();
        }

        /// Make every following `AT S1E2R` report `par`
        pub fn force_par(&self, par: Par) {
            self.forced_par.set(Some(par));
        }

        fn record(&self, op: CpuOp) {
            self.ops.borrow_mut().push(op);
        }
    }

    unsafe impl Cpu for MockCpu {
        fn write_vttbr(&self, value: u64) {
            self.record(CpuOp::WriteVttbr(value));
        }

        fn write_vtcr(&self, value: u64) {
            self.record(CpuOp::WriteVtcr(value));
        }

        fn write_vbar(&self, value: u64) {
            self.record(CpuOp::WriteVbar(value));
        }

        fn isb(&self) {
            self.record(CpuOp::Isb);
        }

        fn dsb(&self, domain: Shareability) {
            self.record(CpuOp::Dsb(domain));
        }

        fn tlb_flush_guest(&self) {
            self.record(CpuOp::TlbFlushGuest);
        }

        fn icache_invalidate(&self) {
            self.record(CpuOp::ICacheInvalidate);
        }

        fn dcaches_flush(&self, op: CacheOp) {
            self.record(CpuOp::DCachesFlush(op));
        }

        fn hyp_stub_vectors(&self) -> u64 {
            self.record(CpuOp::GetVectors);
            self.stub_vectors
        }

        fn translate_hyp(&self, vaddr: VAddr) -> Par {
            self.record(CpuOp::TranslateHyp(vaddr));
            if let Some(par) = self.forced_par.get() {
                return par;
            }
            let Some(ttbr) = self.ttbr.get() else {
                return Par(1);
            };
            let paging = unsafe { PagingStructures::from_root(ttbr, HYP_PAGING, self.phys_map) };
            match paging.lookup(vaddr) {
                Some(leaf) => Par(leaf.phys & !0xfff),
                None => Par(1),
            }
        }

        unsafe fn elevate(&self, bootstrap_vectors: PAddr, setup: PAddr, phys2virt_offset: u64) {
            let setup = *(self.phys_map.phys_to_virt(setup) as *const El2Setup);
            let paging = PagingStructures::from_root(setup.ttbr, HYP_PAGING, self.phys_map);
            let bootstrap_mapped = paging.virt2phys(bootstrap_vectors, 0) == Some(bootstrap_vectors);
            self.ttbr.set(Some(setup.ttbr));
            self.record(CpuOp::Elevate {
                bootstrap_vectors,
                setup,
                phys2virt_offset,
                bootstrap_mapped,
            });
        }

        unsafe fn shutdown(&self, routine: PAddr, regs: PAddr, vectors: u64) -> ! {
            self.record(CpuOp::Shutdown {
                routine,
                regs,
                vectors,
            });
            panic!("returned to EL1");
        }

        fn halt(&self) -> ! {
            panic!("core halted");
        }
    }
}
