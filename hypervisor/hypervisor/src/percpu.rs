use crate::cell::Cell;
use crate::id_map::IdMaps;
use arm::asm_utils::{El2Setup, Registers};
use arm::mem::{is_page_aligned, VAddr};

/// Where a core stands in the transition between EL1 and EL2
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum El2State {
    /// EL1 with the host kernel's translation active
    Normal,
    /// The bootstrap vectors are being installed through the hyp stub
    Bootstrap,
    /// EL2 without address translation.
    ///
    /// On the way up the core only passes through it inside the trampoline while [`Cpu::elevate()`] runs, so this
    /// value is only ever stored on the way down.
    ///
    /// [`Cpu::elevate()`]: crate::cpu::Cpu::elevate
    ElevatedPhysical,
    /// EL2 with the hypervisor's own translation tables active
    ElevatedVirtual,
}

/// State of one physical core.
///
/// It lives for the whole uptime of the hypervisor and is handed to every operation concerning the core.
/// The block must be part of the hypervisor image since the EL2 setup is read through its physical address.
#[derive(Debug)]
pub struct PerCpu<'c> {
    pub cpu_id: usize,
    /// Hypervisor virtual address of the page holding the core's stack
    stack: VAddr,
    pub(crate) cell: Option<&'c Cell>,
    pub(crate) flush_dcache: bool,
    pub(crate) id_maps: IdMaps,
    pub(crate) el2_setup: El2Setup,
    /// Context of the host kernel that [`HypMmu::leave()`](crate::mmu_hyp::HypMmu::leave) returns to
    pub guest_regs: Registers,
    pub(crate) state: El2State,
}

impl<'c> PerCpu<'c> {
    pub fn new(cpu_id: usize, stack: VAddr) -> Self {
        assert!(
            is_page_aligned(stack),
            "stack of cpu {cpu_id} at {stack:#x} is not page aligned"
        );
        Self {
            cpu_id,
            stack,
            cell: None,
            flush_dcache: false,
            id_maps: IdMaps::new(),
            el2_setup: El2Setup::default(),
            guest_regs: Registers::default(),
            state: El2State::Normal,
        }
    }

    pub fn stack(&self) -> VAddr {
        self.stack
    }

    /// The cell currently activated on this core
    pub fn cell(&self) -> Option<&'c Cell> {
        self.cell
    }

    /// Whether a data cache flush is due before the next guest entry
    pub fn flush_dcache_pending(&self) -> bool {
        self.flush_dcache
    }

    pub fn id_maps(&self) -> &IdMaps {
        &self.id_maps
    }

    pub fn el2_setup(&self) -> &El2Setup {
        &self.el2_setup
    }

    pub fn state(&self) -> El2State {
        self.state
    }
}
