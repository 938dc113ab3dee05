//! Allocation of physical memory pages for the hypervisor
//!
//! All memory the hypervisor hands out at runtime (paging structures, communication pages, per-cell data) is taken
//! from a fixed region that is reserved for the hypervisor at load time.
//! That region is managed as a [`PagePool`] which is consumed through the [`PageAllocator`] trait so that users
//! don't depend on the concrete pool implementation.
#![no_std]

mod page_pool;
mod traits;

pub use page_pool::{PagePool, PoolPage};
pub use traits::{AllocError, AllocInit, PageAllocator};

/// Size of the pages handed out by a [`PageAllocator`]
pub const PAGE_SIZE: usize = 4096;
