//! Cache maintenance
//!
//! The hypervisor needs to maintain caches by hand whenever memory is accessed with different cacheability, e.g.
//! while the MMU of EL2 is switched off, or when the translation table walker does not snoop the data caches.

#[cfg(target_arch = "aarch64")]
use crate::barrier::{dsb, isb, Shareability};
#[cfg(target_arch = "aarch64")]
use crate::cpu::{CcsidrEl1, ClidrEl1, CsselrEl1, CtrEl0};
#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// A data cache maintenance operation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheOp {
    /// Write dirty lines back to memory
    Clean,
    /// Drop lines without writing them back
    Invalidate,
    /// Write dirty lines back and drop them
    CleanAndInvalidate,
}

/// Apply `op` to all data and unified caches of the executing core by set/way.
///
/// The levels up to the level of coherency reported by CLIDR_EL1 are walked.
#[cfg(target_arch = "aarch64")]
pub fn dcaches_flush(op: CacheOp) {
    let clidr = ClidrEl1::read_raw();
    let level_of_coherency = (clidr >> 24) & 0b111;

    for level in 0..level_of_coherency {
        let cache_type = (clidr >> (level * 3)) & 0b111;
        // 0 = no cache, 1 = instruction cache only
        if cache_type < 2 {
            continue;
        }

        unsafe { CsselrEl1::write_raw(level << 1) };
        isb();
        let ccsidr = CcsidrEl1::read_raw();
        let line_shift = (ccsidr & 0b111) + 4;
        let ways = ((ccsidr >> 3) & 0x3ff) + 1;
        let sets = ((ccsidr >> 13) & 0x7fff) + 1;
        let way_shift = ((ways - 1) as u32).leading_zeros();

        for way in 0..ways {
            for set in 0..sets {
                let set_way = way.checked_shl(way_shift).unwrap_or(0) | (set << line_shift) | (level << 1);
                unsafe {
                    match op {
                        CacheOp::Clean => asm!("dc csw, {}", in(reg) set_way, options(nostack)),
                        CacheOp::Invalidate => asm!("dc isw, {}", in(reg) set_way, options(nostack)),
                        CacheOp::CleanAndInvalidate => {
                            asm!("dc cisw, {}", in(reg) set_way, options(nostack))
                        }
                    }
                }
            }
        }
    }

    dsb(Shareability::FullSystem);
    isb();
}

/// Invalidate the whole instruction cache of the executing core
#[cfg(target_arch = "aarch64")]
pub fn icache_invalidate_all() {
    unsafe { asm!("ic iallu", options(nostack, preserves_flags)) };
    dsb(Shareability::NonShareable);
    isb();
}

/// Clean the data cache lines covering `len` bytes from `start` to the point of coherency
#[cfg(target_arch = "aarch64")]
pub fn clean_dcache_range(start: usize, len: usize) {
    let line_size = 4 << ((CtrEl0::read_raw() >> 16) & 0xf) as usize;
    let mut addr = start & !(line_size - 1);
    while addr < start + len {
        unsafe { asm!("dc cvac, {}", in(reg) addr, options(nostack)) };
        addr += line_size;
    }
    dsb(Shareability::InnerShareable);
}

/// There are no caches to maintain when running on the build host
#[cfg(not(target_arch = "aarch64"))]
pub fn clean_dcache_range(_start: usize, _len: usize) {}
