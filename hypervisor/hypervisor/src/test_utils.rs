extern crate std;

use allocators::{PagePool, PoolPage, PAGE_SIZE};
use arm::mem::{PAddr, PhysMapping};
use std::vec;

/// Physical address that pool memory pretends to live at, 2 MiB aligned
pub const POOL_PHYS: PAddr = 0x7c00_0000;

/// Run `f` with a page pool of `pages` pages.
///
/// The physical addresses handed out are congruent to the host addresses modulo 2 MiB so that alignment of pool
/// allocations carries over to their physical aliases.
pub fn with_pool<R>(pages: usize, f: impl FnOnce(&PagePool, PhysMapping) -> R) -> R {
    let mut mem = vec![PoolPage::zeroed(); pages];
    let virt = mem.as_ptr() as u64;
    let phys_map = PhysMapping::new(virt, POOL_PHYS | (virt & 0x1f_ffff), (pages * PAGE_SIZE) as u64);
    let pool = PagePool::new(&mut mem);
    f(&pool, phys_map)
}
