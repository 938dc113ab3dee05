use crate::PoolPage;
use core::ptr::NonNull;
use thiserror_no_std::Error;

/// The error returned when an allocation fails
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("the allocator has insufficient free memory to allocate the requested amount")]
    InsufficientMemory,
    #[error("allocations of {0} pages are not supported")]
    InvalidSize(usize),
}

/// A desired initial state for allocated memory
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocInit {
    /// The memory is returned as-is from the allocator.
    /// It may potentially contain old data and treating it as valid is undefined behavior.
    Uninitialized,

    /// Memory is filled with zeros before being returned to the caller.
    #[default]
    Zeroed,

    /// Memory is filled with a repetition of the given byte before being returned to the caller.
    Data(u8),
}

/// An implementation of `PageAllocator` can allocate and free contiguous runs of pages.
pub trait PageAllocator {
    /// Allocate `pages` contiguous pages.
    fn alloc(&self, pages: usize, init: AllocInit) -> Result<NonNull<PoolPage>, AllocError>;

    /// Allocate `pages` contiguous pages whose start is aligned to the allocation size rounded up to the next power
    /// of two.
    ///
    /// This is what translation table roots that consist of multiple concatenated pages require.
    fn alloc_aligned(&self, pages: usize, init: AllocInit)
        -> Result<NonNull<PoolPage>, AllocError>;

    /// Return previously allocated pages to the allocator.
    ///
    /// # Safety
    /// `ptr` and `pages` must describe exactly one previous allocation from this allocator which must not be used
    /// anymore.
    unsafe fn free(&self, ptr: NonNull<PoolPage>, pages: usize);
}

impl<A: PageAllocator + ?Sized> PageAllocator for &A {
    fn alloc(&self, pages: usize, init: AllocInit) -> Result<NonNull<PoolPage>, AllocError> {
        (**self).alloc(pages, init)
    }

    fn alloc_aligned(
        &self,
        pages: usize,
        init: AllocInit,
    ) -> Result<NonNull<PoolPage>, AllocError> {
        (**self).alloc_aligned(pages, init)
    }

    unsafe fn free(&self, ptr: NonNull<PoolPage>, pages: usize) {
        (**self).free(ptr, pages)
    }
}
