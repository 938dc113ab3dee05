//! Routines for switching between EL1 and EL2 that have to be implemented in assembly
//!
//! Exactly relates to `./asm/trampoline.S`.
//! The data structures in this module are read by that assembly code and their layout is part of the contract.

#[cfg(target_arch = "aarch64")]
use crate::mem::PAddr;
use core::mem::{offset_of, size_of};
use static_assertions::const_assert_eq;

/// The translation configuration that [`arm_elevate`] programs into EL2 before it enables the MMU.
///
/// The block is read with the MMU switched off, so it must be cleaned from the data cache before the switch.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct El2Setup {
    pub mair: u64,
    pub tcr: u64,
    pub ttbr: u64,
}

const_assert_eq!(offset_of!(El2Setup, mair), 0);
const_assert_eq!(offset_of!(El2Setup, tcr), 8);
const_assert_eq!(offset_of!(El2Setup, ttbr), 16);

/// General purpose register context of a core, restored by [`arm_shutdown_el2`] when returning to EL1
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Registers {
    /// `x0` to `x30`
    pub x: [u64; 31],
    /// Address execution continues at after the exception return
    pub elr: u64,
    /// Processor state restored by the exception return
    pub spsr: u64,
}

const_assert_eq!(offset_of!(Registers, elr), 248);
const_assert_eq!(offset_of!(Registers, spsr), 256);
const_assert_eq!(size_of::<Registers>(), 264);

impl Default for Registers {
    fn default() -> Self {
        Self {
            x: [0; 31],
            elr: 0,
            spsr: 0,
        }
    }
}

#[cfg(target_arch = "aarch64")]
#[allow(dead_code)]
extern "C" {
    /// Move the calling core from EL1 to EL2 and enable the EL2 MMU.
    ///
    /// - `bootstrap_vectors` is the physical address of [`bootstrap_vectors`].
    /// - `setup` is the physical address of an [`El2Setup`].
    /// - `phys2virt_offset` is added to a physical address of the hypervisor image to get its virtual alias.
    ///
    /// The routine, the calling core's stack and the current page of the stack must be identity mapped in the
    /// tables referenced by `setup`.
    /// It returns at EL2 on the same virtual stack.
    pub fn arm_elevate(bootstrap_vectors: PAddr, setup: PAddr, phys2virt_offset: u64);

    /// Disable the EL2 MMU, restore `vectors` as VBAR_EL2 and return to EL1 with the register context at `regs`.
    ///
    /// Must be called at the physical (identity mapped) alias of the routine.
    pub fn arm_shutdown_el2(regs: PAddr, vectors: u64) -> !;

    /// Vector table that is active while the MMU of EL2 is still off
    pub static bootstrap_vectors: u8;
    pub static __trampoline_start: u8;
    pub static __trampoline_end: u8;
}
