//! Memory and instruction synchronisation barriers

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// The set of observers a data synchronisation barrier waits for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Shareability {
    /// Only the executing core (`nsh`)
    NonShareable,
    /// All cores of the inner shareable domain (`ish`)
    InnerShareable,
    /// The full system (`sy`)
    FullSystem,
}

/// Instruction synchronisation barrier.
///
/// Required after writing a system register before any instruction that depends on the new value.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn isb() {
    unsafe { asm!("isb", options(nostack, preserves_flags)) }
}

/// Data synchronisation barrier for the given domain
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn dsb(domain: Shareability) {
    unsafe {
        match domain {
            Shareability::NonShareable => asm!("dsb nsh", options(nostack, preserves_flags)),
            Shareability::InnerShareable => asm!("dsb ish", options(nostack, preserves_flags)),
            Shareability::FullSystem => asm!("dsb sy", options(nostack, preserves_flags)),
        }
    }
}
