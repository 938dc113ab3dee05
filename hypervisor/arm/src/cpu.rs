//! Handling of AArch64 system registers
//!
//! This module implements some dummy structs which each model a certain system register as it is defined in the
//! [Arm Architecture Reference Manual for A-profile architecture](https://developer.arm.com/documentation/ddi0487/latest).
//! Only the registers the hypervisor accesses from Rust are modelled, the trampoline handles the rest itself.
//!
//! The values written to those registers are computed by plain functions that are available on every target so that
//! they can be checked without hardware.

use crate::mem::{PAddr, OUTPUT_ADDR_MASK};
#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Generate code to read from a specific system register.
///
/// # Example:
/// ```ignore
/// let val = read_sysreg!("sctlr_el2");
/// ```
#[cfg(target_arch = "aarch64")]
macro_rules! read_sysreg {
    ($reg:literal) => {{
        let res: u64;
        asm!(concat!("mrs {}, ", $reg), out(reg) res, options(nomem, nostack));
        res
    }};
}

/// Generate code to write to a specific system register.
///
/// # Example
/// ```ignore
/// write_sysreg!("vbar_el2", 0x7c000800)
/// ```
#[cfg(target_arch = "aarch64")]
macro_rules! write_sysreg {
    ($reg:literal, $value:expr) => {
        asm!(concat!("msr ", $reg, ", {}"), in(reg) $value, options(nostack))
    };
}

/// Define a struct modelling one system register with raw read and write accessors
macro_rules! sysreg {
    ($(#[$meta:meta])* $name:ident, $reg:literal) => {
        $(#[$meta])*
        pub struct $name {}

        #[cfg(target_arch = "aarch64")]
        impl $name {
            #[inline(always)]
            pub fn read_raw() -> u64 {
                unsafe { read_sysreg!($reg) }
            }

            /// # Safety
            /// Writing to system registers changes how the CPU operates and can break every assumption that other
            /// code relies on.
            #[inline(always)]
            pub unsafe fn write_raw(value: u64) {
                write_sysreg!($reg, value)
            }
        }
    };
}

sysreg!(
    /// Virtualization Translation Table Base Register.
    ///
    /// Holds the root of the stage-2 tables of the running cell together with its VMID.
    VttbrEl2,
    "vttbr_el2"
);
sysreg!(
    /// Virtualization Translation Control Register
    VtcrEl2,
    "vtcr_el2"
);
sysreg!(
    /// Vector Base Address Register (EL2)
    VbarEl2,
    "vbar_el2"
);
sysreg!(
    /// Cache Level ID Register
    ClidrEl1,
    "clidr_el1"
);
sysreg!(
    /// Current Cache Size ID Register, describes the cache selected by [`CsselrEl1`]
    CcsidrEl1,
    "ccsidr_el1"
);
sysreg!(
    /// Cache Size Selection Register
    CsselrEl1,
    "csselr_el1"
);
sysreg!(
    /// Cache Type Register
    CtrEl0,
    "ctr_el0"
);

/// Index into MAIR_EL2 for normal, write-back cacheable memory
pub const MAIR_IDX_NORMAL: u64 = 0;
/// Index into MAIR_EL2 for device nGnRE memory
pub const MAIR_IDX_DEVICE: u64 = 1;

/// Value of MAIR_EL2: normal inner/outer write-back read/write-allocate memory at index 0, device nGnRE at index 1
pub const MAIR_EL2_VALUE: u64 = (0xff << (8 * MAIR_IDX_NORMAL)) | (0x04 << (8 * MAIR_IDX_DEVICE));

const TCR_RES1: u64 = (1 << 31) | (1 << 23);
/// Inner and outer write-back read/write-allocate cacheable table walks, inner shareable, 4 KiB granule
const TCR_WALK_ATTRS: u64 = (0b01 << 8) | (0b01 << 10) | (0b11 << 12);

/// Compute the value of TCR_EL2 for a `va_bits` wide virtual address space with 48-bit physical addresses
pub const fn tcr_el2(va_bits: u64) -> u64 {
    TCR_RES1 | TCR_WALK_ATTRS | (0b101 << 16) | (64 - va_bits)
}

/// TCR_EL2 value matching [`HYP_PAGING`](crate::mem::HYP_PAGING)
pub const TCR_EL2_VALUE: u64 = tcr_el2(48);

/// VTCR_EL2 value matching [`CELL_PAGING`](crate::mem::CELL_PAGING).
///
/// 40-bit intermediate physical addresses, walks starting at level 1 (SL0 = 1), 40-bit output addresses.
pub const VTCR_CELL: u64 = (1 << 31) | (0b010 << 16) | TCR_WALK_ATTRS | (0b01 << 6) | (64 - 40);

/// Position of the VMID in VTTBR_EL2
pub const VTTBR_VMID_SHIFT: u64 = 48;

/// Compute the value of VTTBR_EL2 that selects the stage-2 tables at `root` tagged with `vmid`
pub const fn vttbr(vmid: u8, root: PAddr) -> u64 {
    ((vmid as u64) << VTTBR_VMID_SHIFT) | (root & OUTPUT_ADDR_MASK)
}

/// The result of an address translation instruction as reported in PAR_EL1
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Par(pub u64);

impl Par {
    const F: u64 = 1 << 0;

    /// Whether the translation aborted
    pub fn is_fault(&self) -> bool {
        self.0 & Self::F != 0
    }

    /// The translated physical address of the page, if the translation succeeded
    pub fn phys_addr(&self) -> Option<PAddr> {
        match self.is_fault() {
            true => None,
            false => Some(self.0 & OUTPUT_ADDR_MASK),
        }
    }
}

/// Translate `vaddr` for a read at EL2 using the current stage-1 tables of EL2
#[cfg(target_arch = "aarch64")]
pub fn at_s1e2r(vaddr: u64) -> Par {
    let par: u64;
    unsafe {
        asm!(
            "at s1e2r, {va}",
            "isb",
            "mrs {par}, par_el1",
            va = in(reg) vaddr,
            par = out(reg) par,
            options(nostack),
        );
    }
    Par(par)
}
