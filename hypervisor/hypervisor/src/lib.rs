//! Memory management core of a partitioning hypervisor on AArch64
//!
//! Two parts make up this crate:
//! - [`mmu_cell`] confines every cell to the physical memory that is configured for it by managing its stage-2
//!   translation tables.
//! - [`mmu_hyp`] moves cores between EL1, where the host kernel runs, and EL2, where the hypervisor runs with its own
//!   translation tables.
//!
//! All hardware access goes through the [`Cpu`](cpu::Cpu) trait.
#![no_std]

pub mod caches;
pub mod cell;
pub mod config;
pub mod cpu;
mod errors;
pub mod id_map;
pub mod logging;
pub mod mmu_cell;
pub mod mmu_hyp;
pub mod percpu;

#[cfg(test)]
mod test_utils;

pub use errors::Error;
