//! AArch64 specific code for the hypervisor
//!
//! Everything in here is either a plain description of architectural data (register values, translation table
//! descriptors) which is usable on every target, or a thin wrapper around an instruction which only exists when
//! compiling for `aarch64`.
#![no_std]

pub mod asm_utils;
pub mod barrier;
pub mod cache;
pub mod cpu;
pub mod hyp_stub;
pub mod mem;
pub mod tlb;
pub mod utils;
