// Physical memory layout

// qemu -machine virt is set up like this,
// based on qemu's hw/riscv/virt.c:
//
// 00100000 -- sifive test device (reboot / power off)
// 00101000 -- goldfish RTC
// 02000000 -- CLINT
// 0C000000 -- PLIC
// 10000000 -- uart0
// 10001000 -- virtio disk
// 80000000 -- boot ROM jumps here in machine mode
//             -kernel loads the kernel here
// unused RAM after 80000000.

// the kernel uses physical memory thus:
// 80000000 -- entry.rs, then kernel text and data
// end      -- kernel heap, then the page free-list area
// PHYSTOP  -- end of RAM used by the kernel

use crate::param::KERNEL_STACK_PAGES;
use crate::riscv::{MAXVA, PGSIZE};

/// sifive test device; a write here reboots or powers off the machine
pub const SYSCON: usize = 0x10_0000;

/// goldfish RTC, nanoseconds since the epoch
pub const RTC0: usize = 0x10_1000;

pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: usize = 10;

pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: usize = 1;

// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0C00_0000;

#[allow(non_snake_case)]
pub const fn PLIC_SENABLE(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}

#[allow(non_snake_case)]
pub const fn PLIC_SPRIORITY(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}

#[allow(non_snake_case)]
pub const fn PLIC_SCLAIM(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

/// the kernel expects there to be RAM for use by the kernel and user pages
/// from physical address 0x80000000 to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// bytes after the kernel image reserved for the buddy heap; the page
/// free-list owns everything from there up to PHYSTOP.
pub const KERNEL_HEAP_SIZE: usize = 1024 * 1024;

/// map the trampoline page to the highest address, in both user and kernel
/// space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// map kernel stacks beneath the trampoline, each followed by an invalid
/// guard page.
pub const fn kstack(p: usize) -> usize {
    TRAMPOLINE - (p + 1) * (KERNEL_STACK_PAGES + 1) * PGSIZE
}

// User memory layout.
// Address zero first:
//   text
//   original data and bss
//   expandable heap
//   ...
//   stack (growing down from USER_STACK_HIGH)
//   TRAPFRAME (proc.trapframe, used by the trampoline)
//   TRAMPOLINE (the same page as in the kernel)

/// per-process trapframe page, just under the trampoline
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Highest address of the user stack; the stack grows down from here.
/// Could be placed anywhere below the TRAPFRAME, a bit lower gives nicer
/// stack addresses while debugging.
pub const USER_STACK_HIGH: usize = TRAPFRAME - 13 * PGSIZE;
