//! Calls into the hyp stub that the host kernel leaves installed at EL2
//!
//! Linux keeps a minimal vector table at EL2 when it does not use virtualization itself.
//! It answers a small set of hypervisor calls, selected by the value in `x0`.

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Return the current value of VBAR_EL2 in `x0`
pub const HVC_GET_VECTORS: u64 = 0;
/// Set VBAR_EL2 to the value in `x1`
pub const HVC_SET_VECTORS: u64 = 1;

/// Ask the hyp stub for the vector base it has installed at EL2
#[cfg(target_arch = "aarch64")]
pub fn get_vectors() -> u64 {
    let vectors: u64;
    unsafe {
        asm!(
            "hvc #0",
            inout("x0") HVC_GET_VECTORS => vectors,
            clobber_abi("C"),
            options(nostack),
        );
    }
    vectors
}
