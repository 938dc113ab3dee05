//! Moving cores between EL1 and EL2
//!
//! The hypervisor is loaded by the host kernel and starts executing at EL1 with the kernel's translation active.
//! [`HypMmu::enter()`] brings a core to EL2 where the hypervisor's own stage-1 tables take over, and
//! [`HypMmu::leave()`] returns it to EL1 for good.
//!
//! Both switch the MMU of EL2 on or off while executing, so the code doing that (the trampoline) and the stack in
//! use have to be identity mapped during the switch.
//!
//! ```text
//!   Normal ──hvc──▶ Bootstrap ──hvc──▶ ElevatedPhysical ──MMU on──▶ ElevatedVirtual
//!     ▲                                       │
//!     └───────────── eret ◀── vectors ◀── MMU off ◀──────────────────── leave
//! ```
//!
//! On the way up `ElevatedPhysical` is passed inside the single call to [`Cpu::elevate()`], which only returns
//! once the MMU is on, so the recorded state jumps from `Bootstrap` to `ElevatedVirtual`.
//!
//! Any error noticed before the switch is returned and leaves the core at EL1.
//! Once the core runs at EL2 there is nothing to fall back to, so failures halt it.

use crate::caches::{self, CacheOp};
use crate::cpu::Cpu;
use crate::errors::Error;
use crate::id_map::{IdMapRelease, IdMapSlot, IdMaps};
use crate::percpu::{El2State, PerCpu};
use allocators::PageAllocator;
use arm::asm_utils::El2Setup;
use arm::cpu::{MAIR_EL2_VALUE, TCR_EL2_VALUE};
use arm::mem::{
    page_align_down, Coherency, PAddr, PagingStructures, PhysMapping, Stage1Flags, VAddr, PAGESIZE,
};
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};
use ksync::SpinLock;

/// Addresses in the hypervisor image that the transitions depend on.
///
/// All of them are hypervisor virtual addresses.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HypLayout {
    /// A page of the hypervisor image that is used to check the translation after enabling the MMU
    pub base: VAddr,
    /// The `.trampoline` section, which must start at a page boundary and fit into one page
    pub trampoline: Range<VAddr>,
    /// Vectors that are installed through the hyp stub, part of the trampoline
    pub bootstrap_vectors: VAddr,
    /// Vectors of the hypervisor at runtime
    pub hyp_vectors: VAddr,
    /// `arm_shutdown_el2`, part of the trampoline
    pub shutdown_routine: VAddr,
}

#[cfg(target_arch = "aarch64")]
impl HypLayout {
    /// Describe the image this code is part of
    pub fn from_linker_symbols(base: VAddr, hyp_vectors: VAddr) -> Self {
        use arm::asm_utils::{__trampoline_end, __trampoline_start, arm_shutdown_el2, bootstrap_vectors};
        use core::ptr::addr_of;

        unsafe {
            Self {
                base,
                trampoline: addr_of!(__trampoline_start) as VAddr..addr_of!(__trampoline_end) as VAddr,
                bootstrap_vectors: addr_of!(bootstrap_vectors) as VAddr,
                hyp_vectors,
                shutdown_routine: arm_shutdown_el2 as usize as VAddr,
            }
        }
    }
}

/// The vector base that was installed at EL2 before the hypervisor took over.
///
/// It is captured by the first core that enters the hypervisor and restored by every core that leaves it.
/// Cores enter one after another, which the boot sequence guarantees, so the compare-and-set only makes a
/// concurrent capture harmless rather than ordering it.
#[derive(Debug, Default)]
pub struct SavedVectors(AtomicU64);

impl SavedVectors {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Return the saved vector base, calling `read` to obtain it if nothing has been captured yet
    pub fn capture(&self, read: impl FnOnce() -> u64) -> u64 {
        if let Some(vectors) = self.get() {
            return vectors;
        }
        let vectors = read();
        match self
            .0
            .compare_exchange(0, vectors, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => vectors,
            Err(first) => first,
        }
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            vectors => Some(vectors),
        }
    }
}

/// Owner of the hypervisor's own (EL2 stage-1) translation tables and driver of the EL1/EL2 transitions
pub struct HypMmu<'a, C: Cpu, A: PageAllocator> {
    cpu: &'a C,
    pool: &'a A,
    paging: SpinLock<PagingStructures>,
    phys_map: PhysMapping,
    layout: HypLayout,
    saved_vectors: SavedVectors,
}

impl<'a, C: Cpu, A: PageAllocator> HypMmu<'a, C, A> {
    /// Take over `paging` which must already map the hypervisor image
    pub fn new(cpu: &'a C, pool: &'a A, paging: PagingStructures, layout: HypLayout) -> Self {
        Self {
            cpu,
            pool,
            phys_map: *paging.phys_map(),
            paging: SpinLock::new(paging),
            layout,
            saved_vectors: SavedVectors::new(),
        }
    }

    pub fn paging(&self) -> &SpinLock<PagingStructures> {
        &self.paging
    }

    pub fn layout(&self) -> &HypLayout {
        &self.layout
    }

    pub fn saved_vectors(&self) -> Option<u64> {
        self.saved_vectors.get()
    }

    /// Bring `core` from EL1 to EL2 and switch to the hypervisor's translation tables.
    ///
    /// An error is only ever returned while the core is still at EL1.
    pub fn enter(&self, core: &mut PerCpu<'_>) -> Result<(), Error> {
        assert_eq!(
            core.state,
            El2State::Normal,
            "cpu {} is already entering or inside the hypervisor",
            core.cpu_id
        );

        let trampoline_phys = self.phys_map.virt_to_phys(self.layout.trampoline.start);
        let trampoline_size = self.layout.trampoline.end - self.layout.trampoline.start;
        let stack_phys = self.phys_map.virt_to_phys(core.stack());

        let mut id_maps = IdMaps::new();
        id_maps.register(IdMapSlot::Trampoline, trampoline_phys, trampoline_size)?;
        id_maps.register(IdMapSlot::Stack, stack_phys, PAGESIZE as u64)?;

        let (ttbr, base_phys) = {
            let paging = self.paging.spin_lock();
            let base_phys = paging
                .virt2phys(self.layout.base, 0)
                .ok_or(Error::NotMapped {
                    addr: self.layout.base,
                })?;
            (paging.root_phys(), page_align_down(base_phys))
        };

        let vectors = self.saved_vectors.capture(|| self.cpu.hyp_stub_vectors());
        log::debug!(
            "cpu {}: entering EL2, host vectors at {vectors:#x}",
            core.cpu_id
        );

        core.id_maps = id_maps;
        self.create_id_maps(core)?;

        // read with the MMU and caches off
        core.el2_setup = El2Setup {
            mair: MAIR_EL2_VALUE,
            tcr: TCR_EL2_VALUE,
            ttbr,
        };
        caches::dcaches_flush(self.cpu, CacheOp::Clean);

        // elevate() returns with the MMU of EL2 already enabled
        core.state = El2State::Bootstrap;
        let setup = self.phys_map.virt_to_phys(&core.el2_setup as *const El2Setup as VAddr);
        unsafe {
            self.cpu.elevate(
                self.phys_map.virt_to_phys(self.layout.bootstrap_vectors),
                setup,
                self.phys_map.phys2virt_offset(),
            )
        };
        core.state = El2State::ElevatedVirtual;

        self.check_mmu_map(self.layout.base, base_phys);
        self.cpu.write_vbar(self.layout.hyp_vectors);
        self.destroy_id_maps(core);

        log::info!("cpu {} is running at EL2", core.cpu_id);
        Ok(())
    }

    /// Return `core` to EL1, resuming the host kernel with the context in [`PerCpu::guest_regs`]
    pub fn leave(&self, core: &mut PerCpu<'_>) -> ! {
        assert_eq!(
            core.state,
            El2State::ElevatedVirtual,
            "cpu {} is not running the hypervisor",
            core.cpu_id
        );
        let Some(vectors) = self.saved_vectors.get() else {
            log::error!("cpu {}: no host vectors to return to", core.cpu_id);
            self.cpu.halt();
        };

        let stack_phys = self.phys_map.virt_to_phys(core.stack());
        let trampoline_phys = self.phys_map.virt_to_phys(self.layout.trampoline.start);
        let regs = self.phys_map.virt_to_phys(&core.guest_regs as *const _ as VAddr);
        let routine = self.phys_map.virt_to_phys(self.layout.shutdown_routine);

        // other cores may be leaving at the same time
        let mapped = {
            let mut paging = self.paging.spin_lock();
            [stack_phys, trampoline_phys].into_iter().try_for_each(|addr| {
                paging.create(
                    self.pool,
                    addr,
                    PAGESIZE as u64,
                    addr,
                    Stage1Flags::DEFAULT.bits(),
                    Coherency::NonCoherent,
                )
            })
        };
        if let Err(e) = mapped {
            self.fatal(core, e.into());
        }

        log::info!("cpu {} is returning to EL1", core.cpu_id);
        caches::dcaches_flush(self.cpu, CacheOp::Clean);

        core.state = El2State::ElevatedPhysical;
        unsafe { self.cpu.shutdown(routine, regs, vectors) }
    }

    /// Map the registers of a device into the hypervisor's address space
    pub fn map_device(&self, phys: PAddr, virt: VAddr, size: u64) -> Result<(), Error> {
        log::debug!("mapping device {phys:#x} at {virt:#x} ({size:#x} bytes)");
        self.paging.spin_lock().create(
            self.pool,
            phys,
            size,
            virt,
            Stage1Flags::DEVICE.bits(),
            Coherency::NonCoherent,
        )?;
        Ok(())
    }

    pub fn unmap_device(&self, virt: VAddr, size: u64) -> Result<(), Error> {
        self.paging
            .spin_lock()
            .destroy(self.pool, virt, size, Coherency::NonCoherent)?;
        Ok(())
    }

    /// Identity map the registered slots, removing what was already created if one of them fails
    fn create_id_maps(&self, core: &mut PerCpu<'_>) -> Result<(), Error> {
        let mut paging = self.paging.spin_lock();
        for (i, &slot) in IdMapSlot::ALL.iter().enumerate() {
            if let Err(e) = core.id_maps.commit(slot, &mut paging, self.pool) {
                for &created in IdMapSlot::ALL[..i].iter().rev() {
                    if let Err(e) = core.id_maps.release(created, &mut paging, self.pool) {
                        log::error!("cpu {}: cannot remove identity map for {created:?}: {e}", core.cpu_id);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn destroy_id_maps(&self, core: &mut PerCpu<'_>) {
        let mut paging = self.paging.spin_lock();
        for slot in IdMapSlot::ALL {
            match core.id_maps.release(slot, &mut paging, self.pool) {
                Ok(IdMapRelease::Removed) => {}
                Ok(IdMapRelease::PreexistingNotRestored) => log::warn!(
                    "cpu {}: identity map for {slot:?} existed before and keeps its attributes",
                    core.cpu_id
                ),
                Err(e) => {
                    drop(paging);
                    self.fatal(core, e);
                }
            }
        }
    }

    /// Halt unless the MMU translates `virt` to `phys`
    fn check_mmu_map(&self, virt: VAddr, phys: PAddr) {
        let actual = self.cpu.translate_hyp(virt).phys_addr();
        if actual != Some(phys) {
            log::error!(
                "{}",
                Error::SanityCheckFailed {
                    expected: phys,
                    actual
                }
            );
            self.cpu.halt();
        }
    }

    fn fatal(&self, core: &PerCpu<'_>, error: Error) -> ! {
        log::error!("cpu {}: {error}, halting", core.cpu_id);
        self.cpu.halt()
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::cpu::mock::{CpuOp, MockCpu};
    use crate::test_utils::with_pool;
    use allocators::{AllocInit, PagePool};
    use arm::cpu::Par;
    use arm::mem::HYP_PAGING;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::vec::Vec;

    const STUB_VECTORS: u64 = 0x4008_0800;
    const HYP_VECTORS: VAddr = 0xffff_c000_0800;

    struct Fixture<'p> {
        cpu: &'p MockCpu,
        hyp: HypMmu<'p, MockCpu, PagePool<'p>>,
        pool: &'p PagePool<'p>,
        phys_map: PhysMapping,
    }

    /// Run `f` with a hypervisor whose image is the page pool, mapped at its host addresses.
    ///
    /// Trampoline, stack and the per-cpu block are pages of the pool.
    fn with_hyp<R>(
        adjust: impl FnOnce(&mut HypLayout),
        f: impl FnOnce(&Fixture, &mut PerCpu<'_>) -> R,
    ) -> R {
        with_pool(64, |pool, phys_map| {
            let cpu = MockCpu::new(phys_map, STUB_VECTORS);
            let mut paging = PagingStructures::new(pool, HYP_PAGING, phys_map).unwrap();
            paging
                .create(
                    pool,
                    phys_map.phys_start,
                    phys_map.size,
                    phys_map.virt_start,
                    Stage1Flags::DEFAULT.bits(),
                    Coherency::NonCoherent,
                )
                .unwrap();

            let page = || pool.alloc(1, AllocInit::Zeroed).unwrap().as_ptr();
            let trampoline = page() as VAddr;
            let stack = page() as VAddr;
            let core = page().cast::<PerCpu>();

            let mut layout = HypLayout {
                base: phys_map.virt_start,
                trampoline: trampoline..trampoline + PAGESIZE as u64,
                bootstrap_vectors: trampoline + 0x800,
                hyp_vectors: HYP_VECTORS,
                shutdown_routine: trampoline + 0x100,
            };
            adjust(&mut layout);

            let fixture = Fixture {
                cpu: &cpu,
                hyp: HypMmu::new(&cpu, pool, paging, layout),
                pool,
                phys_map,
            };
            let core = unsafe {
                core.write(PerCpu::new(0, stack));
                &mut *core
            };
            f(&fixture, core)
        })
    }

    fn is_identity_mapped(fixture: &Fixture, addr: PAddr) -> bool {
        fixture.hyp.paging().spin_lock().virt2phys(addr, 0) == Some(addr)
    }

    #[test]
    fn test_percpu_fits_into_a_page() {
        assert!(core::mem::size_of::<PerCpu>() <= PAGESIZE);
    }

    #[test]
    fn test_enter_reaches_el2() {
        with_hyp(|_| {}, |fixture, core| {
            let layout = fixture.hyp.layout().clone();
            let trampoline_phys = fixture.phys_map.virt_to_phys(layout.trampoline.start);
            let stack_phys = fixture.phys_map.virt_to_phys(core.stack());
            let root = fixture.hyp.paging().spin_lock().root_phys();
            let used_before = fixture.pool.used_pages();

            fixture.hyp.enter(core).unwrap();

            assert_eq!(
                fixture.cpu.ops(),
                [
                    CpuOp::GetVectors,
                    CpuOp::DCachesFlush(CacheOp::Clean),
                    CpuOp::Elevate {
                        bootstrap_vectors: fixture.phys_map.virt_to_phys(layout.bootstrap_vectors),
                        setup: El2Setup {
                            mair: MAIR_EL2_VALUE,
                            tcr: TCR_EL2_VALUE,
                            ttbr: root,
                        },
                        phys2virt_offset: fixture.phys_map.phys2virt_offset(),
                        bootstrap_mapped: true,
                    },
                    CpuOp::TranslateHyp(layout.base),
                    CpuOp::WriteVbar(HYP_VECTORS),
                ]
            );
            assert_eq!(core.state(), El2State::ElevatedVirtual);
            assert_eq!(fixture.hyp.saved_vectors(), Some(STUB_VECTORS));

            // identity maps are gone again, including their intermediate tables
            assert!(!is_identity_mapped(fixture, trampoline_phys));
            assert!(!is_identity_mapped(fixture, stack_phys));
            assert_eq!(fixture.pool.used_pages(), used_before);
        });
    }

    #[test]
    fn test_misaligned_trampoline_aborts_before_anything_happens() {
        with_hyp(
            |layout| layout.trampoline = layout.trampoline.start + 0x10..layout.trampoline.end,
            |fixture, core| {
                let start = fixture.hyp.layout().trampoline.start;
                assert_eq!(
                    fixture.hyp.enter(core),
                    Err(Error::RegionTooLarge {
                        addr: fixture.phys_map.virt_to_phys(start),
                        size: 0xff0
                    })
                );
                assert!(fixture.cpu.ops().is_empty());
                assert_eq!(fixture.hyp.saved_vectors(), None);
                assert_eq!(core.id_maps(), &IdMaps::new());
                assert_eq!(core.state(), El2State::Normal);
            },
        );
    }

    #[test]
    fn test_oversized_trampoline_aborts_before_anything_happens() {
        with_hyp(
            |layout| layout.trampoline = layout.trampoline.start..layout.trampoline.start + 0x2000,
            |fixture, core| {
                assert!(matches!(
                    fixture.hyp.enter(core),
                    Err(Error::RegionTooLarge { size: 0x2000, .. })
                ));
                assert!(fixture.cpu.ops().is_empty());
                assert_eq!(fixture.hyp.saved_vectors(), None);
                assert_eq!(core.id_maps(), &IdMaps::new());
            },
        );
    }

    #[test]
    fn test_exhausted_pool_leaves_the_core_at_el1() {
        with_hyp(|_| {}, |fixture, core| {
            let mut drained = Vec::new();
            while let Ok(page) = fixture.pool.alloc(1, AllocInit::Uninitialized) {
                drained.push(page);
            }
            let trampoline_phys = fixture.phys_map.virt_to_phys(fixture.hyp.layout().trampoline.start);

            assert_eq!(fixture.hyp.enter(core), Err(Error::OutOfMemory));
            assert_eq!(core.state(), El2State::Normal);
            assert!(!is_identity_mapped(fixture, trampoline_phys));
            assert!(!fixture
                .cpu
                .ops()
                .iter()
                .any(|op| matches!(op, CpuOp::Elevate { .. })));
        });
    }

    #[test]
    fn test_sanity_check_mismatch_halts() {
        with_hyp(|_| {}, |fixture, core| {
            fixture.cpu.force_par(Par(0x1234_5000));
            let result = catch_unwind(AssertUnwindSafe(|| fixture.hyp.enter(core)));
            assert!(result.is_err());
            assert!(!fixture.cpu.ops().contains(&CpuOp::WriteVbar(HYP_VECTORS)));
        });
    }

    #[test]
    #[should_panic(expected = "core halted")]
    fn test_translation_fault_after_elevation_halts() {
        with_hyp(|_| {}, |fixture, core| {
            fixture.cpu.force_par(Par(0x809));
            let _ = fixture.hyp.enter(core);
        });
    }

    #[test]
    fn test_existing_identity_mapping_survives_enter() {
        with_hyp(|_| {}, |fixture, core| {
            let stack_phys = fixture.phys_map.virt_to_phys(core.stack());
            fixture
                .hyp
                .paging()
                .spin_lock()
                .create(
                    fixture.pool,
                    stack_phys,
                    PAGESIZE as u64,
                    stack_phys,
                    Stage1Flags::DEFAULT.bits(),
                    Coherency::NonCoherent,
                )
                .unwrap();

            fixture.hyp.enter(core).unwrap();
            assert!(core.id_maps().entry(IdMapSlot::Stack).unwrap().conflict);
            assert!(!core.id_maps().entry(IdMapSlot::Trampoline).unwrap().conflict);
            assert!(is_identity_mapped(fixture, stack_phys));
        });
    }

    #[test]
    fn test_vectors_are_captured_once() {
        let saved = SavedVectors::new();
        assert_eq!(saved.get(), None);
        assert_eq!(saved.capture(|| 0x4008_0800), 0x4008_0800);
        assert_eq!(saved.capture(|| panic!("read twice")), 0x4008_0800);
        assert_eq!(saved.get(), Some(0x4008_0800));
    }

    #[test]
    fn test_leave_returns_to_el1() {
        with_hyp(|_| {}, |fixture, core| {
            fixture.hyp.enter(core).unwrap();
            fixture.cpu.clear();
            let layout = fixture.hyp.layout().clone();
            let regs = fixture
                .phys_map
                .virt_to_phys(&core.guest_regs as *const _ as VAddr);

            let result = catch_unwind(AssertUnwindSafe(|| fixture.hyp.leave(core)));
            assert!(result.is_err());

            assert_eq!(
                fixture.cpu.ops(),
                [
                    CpuOp::DCachesFlush(CacheOp::Clean),
                    CpuOp::Shutdown {
                        routine: fixture.phys_map.virt_to_phys(layout.shutdown_routine),
                        regs,
                        vectors: STUB_VECTORS,
                    }
                ]
            );
            assert_eq!(core.state(), El2State::ElevatedPhysical);
            assert!(is_identity_mapped(
                fixture,
                fixture.phys_map.virt_to_phys(layout.trampoline.start)
            ));
            assert!(is_identity_mapped(
                fixture,
                fixture.phys_map.virt_to_phys(core.stack())
            ));
            assert!(!fixture.hyp.paging().is_locked());
        });
    }

    #[test]
    #[should_panic]
    fn test_leave_without_enter_panics() {
        with_hyp(|_| {}, |fixture, core| fixture.hyp.leave(core));
    }

    #[test]
    fn test_device_mappings() {
        with_hyp(|_| {}, |fixture, _| {
            fixture
                .hyp
                .map_device(0x1c2_8000, 0x1_0000_0000, 0x400)
                .unwrap();
            let leaf = fixture
                .hyp
                .paging()
                .spin_lock()
                .lookup(0x1_0000_0010)
                .unwrap();
            assert_eq!(leaf.phys, 0x1c2_8010);
            assert_eq!(leaf.attrs, Stage1Flags::DEVICE.bits());

            fixture.hyp.unmap_device(0x1_0000_0000, 0x400).unwrap();
            assert_eq!(
                fixture.hyp.unmap_device(0x1_0000_0000, 0x400),
                Err(Error::NotMapped {
                    addr: 0x1_0000_0000
                })
            );
        });
    }
}
