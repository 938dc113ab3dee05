//! TLB maintenance
//!
//! None of these include the barrier that is needed before the invalidation is guaranteed to be complete.
//! Callers issue a [`dsb`](crate::barrier::dsb) afterwards.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Invalidate all stage-1 and stage-2 TLB entries of the current VMID on the executing core
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn flush_guest() {
    unsafe { asm!("tlbi vmalls12e1", options(nostack, preserves_flags)) }
}
