use crate::{AllocError, AllocInit, PageAllocator, PAGE_SIZE};
use core::fmt::{Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use ksync::SpinLock;

/// A single page of pool memory.
///
/// It is exactly one page large and aligned to it as well.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C, align(4096))]
pub struct PoolPage(pub [u8; PAGE_SIZE]);

impl PoolPage {
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }
}

impl Default for PoolPage {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Debug for PoolPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "PoolPage({:p})", self)
    }
}

const BITS_PER_WORD: usize = u64::BITS as usize;

struct PoolState {
    /// First page of the backing memory
    base: *mut PoolPage,
    /// Number of pages in the backing memory, including the ones occupied by the bitmap
    pages: usize,
    /// Number of leading pages that hold the usage bitmap
    bitmap_pages: usize,
    /// One bit per page, set if the page is in use
    bitmap: *mut u64,
    used: usize,
}

// Safety: The raw pointers are only ever dereferenced while the surrounding SpinLock is held
unsafe impl Send for PoolState {}

impl PoolState {
    fn is_used(&self, page: usize) -> bool {
        let word = unsafe { *self.bitmap.add(page / BITS_PER_WORD) };
        word & (1 << (page % BITS_PER_WORD)) != 0
    }

    fn mark(&mut self, page: usize, used: bool) {
        let word = unsafe { &mut *self.bitmap.add(page / BITS_PER_WORD) };
        if used {
            *word |= 1 << (page % BITS_PER_WORD);
        } else {
            *word &= !(1 << (page % BITS_PER_WORD));
        }
    }

    /// Find the first run of `count` free pages whose start address is aligned to `align_pages` pages
    fn find_free_run(&self, count: usize, align_pages: usize) -> Option<usize> {
        let align = align_pages * PAGE_SIZE;
        let misalign = self.base as usize % align;
        let first = if misalign == 0 {
            0
        } else {
            (align - misalign) / PAGE_SIZE
        };

        let mut candidate = first;
        while candidate + count <= self.pages {
            match (candidate..candidate + count).rev().find(|&i| self.is_used(i)) {
                None => return Some(candidate),
                Some(used) => {
                    let next = used + 1 - first;
                    candidate = first + next.div_ceil(align_pages) * align_pages;
                }
            }
        }
        None
    }
}

/// A pool of physical pages which hands out page runs via a usage bitmap.
///
/// The bitmap is stored in the leading pages of the backing memory itself and those pages are accounted as used for
/// the whole lifetime of the pool.
///
/// # Performance Note
/// The implementation internally uses a [`SpinLock`] to achieve interior thread-safe mutability so that the pool can
/// be shared between all cores.
/// Allocation is a linear first-fit search which is fine for the small number of allocations the hypervisor does
/// outside of cell creation.
pub struct PagePool<'mem> {
    state: SpinLock<PoolState>,
    _mem: PhantomData<&'mem mut [PoolPage]>,
}

impl<'mem> PagePool<'mem> {
    /// Create a new pool that allocates from the given memory
    pub fn new(mem: &'mem mut [PoolPage]) -> Self {
        let pages = mem.len();
        let bitmap_pages = pages.div_ceil(PAGE_SIZE * 8);
        assert!(
            pages > bitmap_pages,
            "a page pool of {pages} pages has no room next to its bitmap"
        );

        let base = mem.as_mut_ptr();
        let bitmap = base.cast::<u64>();
        unsafe { ptr::write_bytes(base, 0, bitmap_pages) };

        let mut state = PoolState {
            base,
            pages,
            bitmap_pages,
            bitmap,
            used: bitmap_pages,
        };
        for i in 0..bitmap_pages {
            state.mark(i, true);
        }

        log::debug!(
            "page pool at {base:p} manages {pages} pages ({bitmap_pages} used for bookkeeping)"
        );
        Self {
            state: SpinLock::new(state),
            _mem: PhantomData,
        }
    }

    /// How many pages are currently allocated, including the bitmap pages
    pub fn used_pages(&self) -> usize {
        self.state.spin_lock().used
    }

    /// How many pages the pool manages in total
    pub fn total_pages(&self) -> usize {
        self.state.spin_lock().pages
    }

    /// How many pages are still available
    pub fn free_pages(&self) -> usize {
        let state = self.state.spin_lock();
        state.pages - state.used
    }

    /// Whether `ptr` points into the memory managed by this pool
    pub fn contains(&self, ptr: *const u8) -> bool {
        let state = self.state.spin_lock();
        let start = state.base as usize;
        let end = start + state.pages * PAGE_SIZE;
        (start..end).contains(&(ptr as usize))
    }

    fn alloc_run(
        &self,
        pages: usize,
        align_pages: usize,
        init: AllocInit,
    ) -> Result<NonNull<PoolPage>, AllocError> {
        if pages == 0 {
            return Err(AllocError::InvalidSize(pages));
        }

        let ptr = {
            let mut state = self.state.spin_lock();
            let start = state
                .find_free_run(pages, align_pages)
                .ok_or(AllocError::InsufficientMemory)?;
            for i in start..start + pages {
                state.mark(i, true);
            }
            state.used += pages;
            unsafe { state.base.add(start) }
        };

        match init {
            AllocInit::Uninitialized => {}
            AllocInit::Zeroed => unsafe { ptr::write_bytes(ptr, 0, pages) },
            AllocInit::Data(byte) => unsafe {
                ptr::write_bytes(ptr.cast::<u8>(), byte, pages * PAGE_SIZE)
            },
        }

        log::trace!("allocated {pages} pool pages at {ptr:p}");
        // Safety: ptr is derived from the non-null base of the backing slice
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }
}

impl PageAllocator for PagePool<'_> {
    fn alloc(&self, pages: usize, init: AllocInit) -> Result<NonNull<PoolPage>, AllocError> {
        self.alloc_run(pages, 1, init)
    }

    fn alloc_aligned(
        &self,
        pages: usize,
        init: AllocInit,
    ) -> Result<NonNull<PoolPage>, AllocError> {
        self.alloc_run(pages, pages.max(1).next_power_of_two(), init)
    }

    unsafe fn free(&self, ptr: NonNull<PoolPage>, pages: usize) {
        let mut state = self.state.spin_lock();
        let offset = (ptr.as_ptr() as usize)
            .checked_sub(state.base as usize)
            .filter(|offset| offset % PAGE_SIZE == 0)
            .unwrap_or_else(|| panic!("{ptr:p} was not allocated from this page pool"));
        let start = offset / PAGE_SIZE;
        assert!(
            start >= state.bitmap_pages && start + pages <= state.pages,
            "{ptr:p} (+{pages} pages) is outside of the allocatable pool memory"
        );

        for i in start..start + pages {
            assert!(state.is_used(i), "pool page {i} at {ptr:p} is freed twice");
            state.mark(i, false);
        }
        state.used -= pages;
        log::trace!("freed {pages} pool pages at {ptr:p}");
    }
}

impl Debug for PagePool<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let state = self.state.spin_lock();
        f.debug_struct("PagePool")
            .field("base", &state.base)
            .field("pages", &state.pages)
            .field("used", &state.used)
            .finish()
    }
}
