//! Utilities for running low-level aarch64 specific code

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Put the current core to sleep until an event wakes it up again.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn wait_for_event() {
    unsafe { asm!("wfe", options(nomem, nostack)) }
}

/// Mask all interrupts and call wait_for_event() in a tight loop.
///
/// This stops the core forever.
/// It is the only way out once the hypervisor's own address space can no longer be trusted.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn wfe_spin() -> ! {
    unsafe { asm!("msr daifset, #0xf", options(nomem, nostack)) };
    loop {
        wait_for_event();
    }
}
