#![allow(static_mut_refs)]

use core::cmp::min;
use core::ops::{Add, Deref, DerefMut, Index, IndexMut};

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::KernelError;
use crate::kalloc::PAGES;
use crate::memlayout::{
    KERNBASE, PHYSTOP, PLIC, RTC0, SYSCON, TRAMPOLINE, TRAPFRAME, UART0, USER_STACK_HIGH, VIRTIO0,
};
use crate::proc::PROCS;
use crate::riscv::{
    MAXVA, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X, pa_to_pte, pg_round_down, pg_round_up,
    pte_flags, pte_to_pa, px,
    registers::{satp, vma},
};
use crate::sync::OnceLock;
use crate::trampoline::trampoline;

// kernel.ld sets this to the end of the kernel code
unsafe extern "C" {
    fn etext();
}

pub static mut KVM: OnceLock<Kvm> = OnceLock::new();

/// A physical address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PA(pub usize);

impl PA {
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for PA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// A virtual address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VA(pub usize);

impl VA {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl From<usize> for VA {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Add<usize> for VA {
    type Output = VA;

    fn add(self, rhs: usize) -> Self::Output {
        VA(self.0 + rhs)
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct PageTableEntry(usize);

impl PageTableEntry {
    fn is_v(&self) -> bool {
        self.0 & PTE_V != 0
    }

    fn is_u(&self) -> bool {
        self.0 & PTE_U != 0
    }

    fn is_w(&self) -> bool {
        self.0 & PTE_W != 0
    }

    /// A leaf PTE has at least one of the permission bits set.
    fn is_leaf(&self) -> bool {
        (self.0 & (PTE_X | PTE_W | PTE_R)) != 0
    }

    fn flags(&self) -> usize {
        pte_flags(self.0)
    }

    fn as_pa(&self) -> PA {
        PA(pte_to_pa(self.0))
    }
}

#[repr(C, align(4096))]
struct RawPageTable([PageTableEntry; 512]);

impl RawPageTable {
    fn try_new() -> Result<*mut Self, KernelError> {
        let page = PAGES.alloc_zeroed()?;
        Ok(page as *mut Self)
    }
}

impl Index<usize> for RawPageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<usize> for RawPageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

/// One level of an Sv39 page-table tree.
#[derive(Debug)]
pub struct PageTable {
    ptr: *mut RawPageTable,
}

unsafe impl Send for PageTable {}

impl PageTable {
    pub fn try_new() -> Result<Self, KernelError> {
        Ok(Self {
            ptr: RawPageTable::try_new()?,
        })
    }

    fn from_pa(pa: PA) -> Self {
        Self {
            ptr: pa.0 as *mut RawPageTable,
        }
    }

    pub fn as_pa(&self) -> PA {
        PA(self.ptr as usize)
    }

    /// Returns the leaf PTE slot for `va`, walking the tree from the top.
    /// With `alloc`, missing intermediate tables are created.
    fn walk(&mut self, va: VA, alloc: bool) -> Result<&mut PageTableEntry, KernelError> {
        assert!(va.0 < MAXVA, "walk");

        let mut pagetable = self.ptr;

        unsafe {
            for level in (1..=2).rev() {
                let pte = &mut (*pagetable)[px(level, va.0)];

                if pte.is_v() {
                    pagetable = pte.as_pa().0 as *mut RawPageTable;
                } else {
                    if !alloc {
                        return Err(KernelError::BadAddress);
                    }

                    pagetable = RawPageTable::try_new()?;
                    pte.0 = pa_to_pte(pagetable as usize) | PTE_V;
                }
            }

            Ok(&mut (*pagetable)[px(0, va.0)])
        }
    }

    /// Creates PTEs for virtual addresses starting at `va` referring to
    /// physical addresses starting at `pa`. `va` and `size` must be
    /// page-aligned.
    pub fn map_pages(
        &mut self,
        va: VA,
        pa: PA,
        size: usize,
        perm: usize,
    ) -> Result<(), KernelError> {
        assert_eq!(va.0 % PGSIZE, 0, "map_pages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "map_pages: size not aligned");
        assert_ne!(size, 0, "map_pages: size");

        let last = va.0 + size - PGSIZE;
        let mut va = va;
        let mut pa = pa.0;

        loop {
            let pte = self.walk(va, true)?;
            assert!(!pte.is_v(), "map_pages: remap");

            pte.0 = pa_to_pte(pa) | perm | PTE_V;

            if va.0 == last {
                break;
            }

            va.0 += PGSIZE;
            pa += PGSIZE;
        }

        Ok(())
    }

    /// Recursively frees page-table pages.
    /// All leaf mappings must already have been removed.
    fn free_walk(self) {
        let pagetable = unsafe { &mut *self.ptr };

        for pte in pagetable.0.iter_mut() {
            if pte.is_v() {
                if pte.is_leaf() {
                    panic!("free_walk: leaf");
                }

                let child = PageTable::from_pa(pte.as_pa());
                child.free_walk();
                *pte = PageTableEntry(0);
            }
        }

        unsafe { PAGES.free(self.ptr as *mut u8) };
    }
}

/// The kernel page table: all of RAM and the MMIO regions, mapped at their
/// physical addresses, plus the trampoline and per-process kernel stacks.
#[derive(Debug)]
pub struct Kvm(PageTable);

impl Kvm {
    fn new() -> Result<Self, KernelError> {
        Ok(Self(PageTable::try_new()?))
    }

    pub fn map(&mut self, va: VA, pa: PA, size: usize, perm: usize) {
        if self.0.map_pages(va, pa, size, perm).is_err() {
            panic!("kvm map");
        }
    }

    unsafe fn make(&mut self) {
        // sifive test device and goldfish rtc
        self.map(VA(SYSCON), PA(SYSCON), PGSIZE, PTE_R | PTE_W);
        self.map(VA(RTC0), PA(RTC0), PGSIZE, PTE_R | PTE_W);

        // uart registers
        self.map(VA(UART0), PA(UART0), PGSIZE, PTE_R | PTE_W);

        // virtio mmio disk interface
        self.map(VA(VIRTIO0), PA(VIRTIO0), PGSIZE, PTE_R | PTE_W);

        // PLIC
        self.map(VA(PLIC), PA(PLIC), 0x40_0000, PTE_R | PTE_W);

        // kernel text, executable and read-only
        let etext = etext as *const () as usize;
        self.map(VA(KERNBASE), PA(KERNBASE), etext - KERNBASE, PTE_R | PTE_X);

        // kernel data and the physical RAM
        self.map(VA(etext), PA(etext), PHYSTOP - etext, PTE_R | PTE_W);

        // trampoline for trap entry/exit, mapped to the highest virtual
        // address in the kernel
        self.map(
            VA(TRAMPOLINE),
            PA(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        );

        unsafe { PROCS.map_stacks(self) };
    }
}

/// A user address space: text/data/heap from address zero, a stack growing
/// down from USER_STACK_HIGH, the trapframe and the trampoline at the top.
#[derive(Debug)]
pub struct Uvm(PageTable);

impl Uvm {
    /// Creates an empty user page table.
    pub fn try_new() -> Result<Self, KernelError> {
        Ok(Self(PageTable::try_new()?))
    }

    /// Looks up a virtual address and returns the physical address.
    /// Can only be used for user pages.
    pub fn physical_addr(&mut self, va: VA) -> Result<PA, KernelError> {
        if va.0 >= MAXVA {
            return Err(KernelError::BadAddress);
        }

        let pte = self.0.walk(va, false)?;

        if !pte.is_v() || !pte.is_u() {
            return Err(KernelError::BadAddress);
        }

        Ok(pte.as_pa())
    }

    /// Removes `npages` of mappings starting from `va`. `va` must be
    /// page-aligned and the mappings must exist.
    /// Optionally frees the physical frames.
    pub fn unmap(&mut self, va: VA, npages: usize, free: bool) {
        assert!(va.0 % PGSIZE == 0, "uvm unmap: not aligned");

        for va in (va.0..va.0 + npages * PGSIZE).step_by(PGSIZE) {
            match self.0.walk(VA(va), false) {
                Err(_) => panic!("uvm unmap: walk"),
                Ok(pte) if !pte.is_v() => panic!("uvm unmap: not mapped"),
                Ok(pte) if !pte.is_leaf() => panic!("uvm unmap: not a leaf"),
                Ok(pte) => {
                    if free {
                        unsafe { PAGES.free(pte.as_pa().0 as *mut u8) };
                    }
                    *pte = PageTableEntry(0);
                }
            }
        }
    }

    /// Maps fresh zeroed frames over `[start, end)`, both page-aligned.
    /// On failure everything mapped by this call is freed again.
    pub fn alloc_range(&mut self, start: VA, end: VA, xperm: usize) -> Result<(), KernelError> {
        assert!(start.0 % PGSIZE == 0, "uvm alloc_range: not aligned");

        for va in (start.0..end.0).step_by(PGSIZE) {
            let mem = match PAGES.alloc_zeroed() {
                Ok(mem) => mem,
                Err(err) => {
                    self.unmap(start, (va - start.0) / PGSIZE, true);
                    return Err(err);
                }
            };

            if let Err(err) = self.0.map_pages(
                VA(va),
                PA(mem as usize),
                PGSIZE,
                PTE_R | PTE_U | xperm,
            ) {
                unsafe { PAGES.free(mem) };
                self.unmap(start, (va - start.0) / PGSIZE, true);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Allocates PTEs and physical memory to grow the process heap from
    /// `old_size` to `new_size`, which need not be page-aligned.
    /// Returns the new size.
    pub fn alloc(
        &mut self,
        old_size: usize,
        new_size: usize,
        xperm: usize,
    ) -> Result<usize, KernelError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        self.alloc_range(
            VA(pg_round_up(old_size)),
            VA(pg_round_up(new_size)),
            xperm,
        )?;

        Ok(new_size)
    }

    /// Deallocates user pages to bring the heap from `old_size` down to
    /// `new_size`. Neither needs to be page-aligned. Returns the new size.
    pub fn dealloc(&mut self, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        let old_aligned = pg_round_up(old_size);
        let new_aligned = pg_round_up(new_size);

        if new_aligned < old_aligned {
            let npages = (old_aligned - new_aligned) / PGSIZE;
            self.unmap(VA(new_aligned), npages, true);
        }

        new_size
    }

    /// Clones all mapped pages in `[start, end)` into `dst`, frames and
    /// contents both. Fails atomically: on error nothing copied by this call
    /// remains mapped in `dst`.
    pub fn copy_range(&mut self, dst: &mut Uvm, start: VA, end: VA) -> Result<(), KernelError> {
        assert!(start.0 % PGSIZE == 0, "uvm copy: not aligned");

        for va in (start.0..pg_round_up(end.0)).step_by(PGSIZE) {
            let pte = match self.0.walk(VA(va), false) {
                Ok(pte) if pte.is_v() => pte,
                _ => panic!("uvm copy: page not present"),
            };

            let pa = pte.as_pa();
            let flags = pte.flags();

            let undo = |dst: &mut Uvm| {
                if va > start.0 {
                    dst.unmap(start, (va - start.0) / PGSIZE, true);
                }
            };

            let mem = match PAGES.alloc() {
                Ok(mem) => mem,
                Err(err) => {
                    undo(dst);
                    return Err(err);
                }
            };

            unsafe {
                core::ptr::copy_nonoverlapping(pa.0 as *const u8, mem, PGSIZE);
            }

            if let Err(err) = dst.0.map_pages(VA(va), PA(mem as usize), PGSIZE, flags) {
                unsafe { PAGES.free(mem) };
                undo(dst);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Frees all user memory (heap and stack) and then the page-table pages.
    /// The trampoline and trapframe mappings are removed but their frames
    /// are owned elsewhere.
    pub fn proc_free(mut self, heap_size: usize, stack_low: VA) {
        self.unmap(VA(TRAMPOLINE), 1, false);
        self.unmap(VA(TRAPFRAME), 1, false);

        if heap_size > 0 {
            self.unmap(VA(0), pg_round_up(heap_size) / PGSIZE, true);
        }

        if stack_low.0 != 0 {
            let npages = (USER_STACK_HIGH - stack_low.0) / PGSIZE;
            self.unmap(stack_low, npages, true);
        }

        self.0.free_walk();
    }

    /// Copies from kernel to user: `src` to virtual address `dst_va` in this
    /// page table. The destination must be user-accessible and writable.
    pub fn copy_out(&mut self, mut src: &[u8], dst_va: VA) -> Result<(), KernelError> {
        let mut dst_va = dst_va.0;

        while !src.is_empty() {
            let va0 = pg_round_down(dst_va);

            if va0 >= MAXVA {
                return Err(KernelError::BadAddress);
            }

            let pte = self.0.walk(VA(va0), false)?;

            if !pte.is_v() || !pte.is_u() || !pte.is_w() {
                return Err(KernelError::BadAddress);
            }

            let pa0 = pte.as_pa();
            let n = min(PGSIZE - (dst_va - va0), src.len());

            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    (pa0.0 + (dst_va - va0)) as *mut u8,
                    n,
                );
            }

            src = &src[n..];
            dst_va = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copies from user to kernel: virtual address `src_va` in this page
    /// table into `dst`.
    pub fn copy_in(&mut self, dst: &mut [u8], src_va: VA) -> Result<(), KernelError> {
        let mut dst = dst;
        let mut src_va = src_va.0;

        while !dst.is_empty() {
            let va0 = pg_round_down(src_va);
            let pa0 = self.physical_addr(VA(va0))?;

            let n = min(PGSIZE - (src_va - va0), dst.len());

            unsafe {
                core::ptr::copy_nonoverlapping(
                    (pa0.0 + (src_va - va0)) as *const u8,
                    dst.as_mut_ptr(),
                    n,
                );
            }

            dst = &mut dst[n..];
            src_va = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copies a NUL-terminated string from user space, stopping at the NUL
    /// or after `max` bytes (then the string was too long: error).
    pub fn copy_in_str(&mut self, src_va: VA, max: usize) -> Result<String, KernelError> {
        let mut bytes: Vec<u8> = Vec::new();
        let mut src_va = src_va.0;
        let mut left = max;

        while left > 0 {
            let va0 = pg_round_down(src_va);
            let pa0 = self.physical_addr(VA(va0))?;

            let n = min(PGSIZE - (src_va - va0), left);

            for i in 0..n {
                let c = unsafe { *((pa0.0 + (src_va - va0) + i) as *const u8) };
                if c == 0 {
                    return String::from_utf8(bytes).or(Err(KernelError::InvalidArgument));
                }
                bytes.push(c);
            }

            left -= n;
            src_va = va0 + PGSIZE;
        }

        Err(KernelError::ArgumentListTooLong)
    }
}

impl Deref for Uvm {
    type Target = PageTable;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Uvm {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Builds the kernel page table.
pub fn init() {
    unsafe {
        KVM.initialize(Kvm::new);
        KVM.get_mut().expect("kvm to be init").make();
    }
}

/// Switches the hardware page-table register to the kernel's page table and
/// enables paging.
pub fn init_hart() {
    unsafe {
        // wait for any previous writes to the page table memory to finish
        vma::sfence();

        satp::write(satp::make(KVM.get().unwrap().0.as_pa().0));

        // flush stale entries from the TLB
        vma::sfence();
    }
}
