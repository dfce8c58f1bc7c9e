use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use buddy_alloc::{BuddyAllocParam, buddy_alloc::BuddyAlloc};

use crate::error::KernelError;
use crate::memlayout::{KERNEL_HEAP_SIZE, PHYSTOP};
use crate::println;
use crate::riscv::{PGSIZE, pg_round_up};
use crate::spinlock::SpinLock;

// first address after the kernel image, defined by kernel.ld
unsafe extern "C" {
    static end: [u8; 0];
}

/// Heap for small kernel objects (Box, String, Arc, Vec), carved out right
/// after the kernel image. Page-sized allocations go through PAGES instead.
#[global_allocator]
static KMEM: Kmem = Kmem(SpinLock::new(None, "kmem"));

struct Kmem(SpinLock<Option<BuddyAlloc>>);
unsafe impl Sync for Kmem {}

unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .expect("kmem to be init")
            .malloc(layout.size().max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().as_mut().expect("kmem to be init").free(ptr)
    }
}

#[alloc_error_handler]
fn handle_alloc_error(layout: Layout) -> ! {
    panic!("alloc error: {:?}", layout)
}

/// Physical page allocator.
///
/// Free pages are threaded through a singly-linked list whose link lives in
/// the free page itself, so the allocator needs no memory of its own. Both
/// operations are O(1) under one spinlock.
pub static PAGES: PageAllocator = PageAllocator {
    free: SpinLock::new(
        FreeList {
            head: ptr::null_mut(),
            npages: 0,
        },
        "pages",
    ),
};

struct FreeNode {
    next: *mut FreeNode,
}

pub struct FreeList {
    head: *mut FreeNode,
    npages: usize,
}

unsafe impl Send for FreeList {}

pub struct PageAllocator {
    free: SpinLock<FreeList>,
}

impl PageAllocator {
    /// Allocates one 4096-byte page of physical memory.
    /// In debug builds the page is filled with junk to expose reads of
    /// uninitialized memory.
    pub fn alloc(&self) -> Result<*mut u8, KernelError> {
        let mut free = self.free.lock();

        if free.head.is_null() {
            return Err(KernelError::OutOfMemory);
        }

        let page = free.head;
        free.head = unsafe { (*page).next };
        free.npages -= 1;
        drop(free);

        let page = page as *mut u8;

        #[cfg(debug_assertions)]
        unsafe {
            ptr::write_bytes(page, 5, PGSIZE)
        };

        Ok(page)
    }

    /// Allocates one zeroed page.
    pub fn alloc_zeroed(&self) -> Result<*mut u8, KernelError> {
        let page = self.alloc()?;
        unsafe { ptr::write_bytes(page, 0, PGSIZE) };
        Ok(page)
    }

    /// Returns a page to the free list.
    ///
    /// # Safety
    /// `page` must have come from `alloc` and must not be used afterwards.
    pub unsafe fn free(&self, page: *mut u8) {
        let pa = page as usize;
        assert!(pa % PGSIZE == 0, "free_page: not aligned");
        assert!(
            pa >= page_area_start() && pa < PHYSTOP,
            "free_page: out of range"
        );

        // fill with junk to catch dangling references
        #[cfg(debug_assertions)]
        unsafe {
            ptr::write_bytes(page, 1, PGSIZE)
        };

        let node = page as *mut FreeNode;
        let mut free = self.free.lock();
        unsafe { (*node).next = free.head };
        free.head = node;
        free.npages += 1;
    }

    /// Number of pages currently free.
    pub fn free_pages(&self) -> usize {
        self.free.lock().npages
    }
}

fn page_area_start() -> usize {
    pg_round_up(unsafe { end.as_ptr() as usize } + KERNEL_HEAP_SIZE)
}

/// Hand all RAM between the kernel heap and PHYSTOP to the page allocator
/// and bring up the object heap.
///
/// # Safety
/// Must be called exactly once, on the boot hart, before any allocation.
pub unsafe fn init() {
    unsafe {
        let heap_base = end.as_ptr();

        let mut heap = KMEM.0.lock();
        *heap = Some(BuddyAlloc::new(BuddyAllocParam::new(
            heap_base,
            KERNEL_HEAP_SIZE,
            16,
        )));
        drop(heap);

        let first = page_area_start();
        for pa in (first..PHYSTOP).step_by(PGSIZE) {
            PAGES.free(pa as *mut u8);
        }

        println!("kmem init: {} pages free", PAGES.free_pages());
    }
}
