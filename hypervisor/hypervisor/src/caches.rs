//! Cache and TLB synchronisation points shared by the stage-2 manager and the transition engine

use crate::cpu::Cpu;
use arm::barrier::Shareability;
pub use arm::cache::CacheOp;

/// Invalidate all guest TLB entries of the current VMID and wait for completion on this core.
///
/// The exception return into the guest provides the context synchronisation.
pub fn cpu_tlb_flush(cpu: &impl Cpu) {
    cpu.tlb_flush_guest();
    cpu.dsb(Shareability::NonShareable);
}

/// Make a freshly written VTTBR_EL2 visible and drop every translation cached under the VMID it selects
pub fn activate_sync(cpu: &impl Cpu) {
    cpu.isb();
    cpu_tlb_flush(cpu);
}

pub fn icache_flush(cpu: &impl Cpu) {
    cpu.icache_invalidate();
}

pub fn dcaches_flush(cpu: &impl Cpu, op: CacheOp) {
    cpu.dcaches_flush(op);
}
