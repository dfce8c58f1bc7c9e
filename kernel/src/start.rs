use core::arch::asm;

use crate::param::MAX_CPUS;
use crate::riscv::registers::*;

#[repr(C, align(16))]
struct Stack([u8; 4096 * MAX_CPUS]);

/// boot stacks, one page per hart, used until the scheduler runs on the
/// per-process kernel stacks
#[unsafe(no_mangle)]
static mut STACK0: Stack = Stack([0; 4096 * MAX_CPUS]);

unsafe extern "C" {
    fn main() -> !;
}

/// Arranges for each hart to receive timer interrupts through the sstc
/// extension (stimecmp), so the kernel never re-enters machine mode.
unsafe fn timer_init() {
    unsafe {
        // enable supervisor-mode timer interrupts
        mie::write(mie::read() | mie::STIE);

        // enable the sstc extension (i.e. stimecmp)
        menvcfg::write(menvcfg::read() | (1 << 63));

        // allow supervisor to use stimecmp and time
        mcounteren::write(mcounteren::read() | 2);

        // ask for the very first timer interrupt
        stimecmp::write(time::read() + 1_000_000);
    }
}

/// Machine-mode entry point for every hart.
///
/// # Safety
/// Called from `entry.rs` on the boot stack.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn start() -> ! {
    unsafe {
        // when mret runs at the end of this function we land in supervisor
        // mode, at main
        mstatus::set_mpp(mstatus::MPP_SUPERVISOR);
        mepc::write(main as *const () as usize);

        // disable paging for now
        satp::write(0);

        // delegate all interrupts and exceptions to supervisor mode
        medeleg::write(0xffff);
        mideleg::write(0xffff);
        sie::write(sie::read() | sie::SEIE | sie::STIE | sie::SSIE);

        // give supervisor mode access to all of physical memory
        pmpaddr0::write(0x3fffffffffffff);
        pmpcfg0::write(0xf);

        timer_init();

        // keep the hart id in tp, for current_cpu()
        let id = mhartid::read();
        tp::write(id);

        asm!("mret", options(noreturn));
    }
}
