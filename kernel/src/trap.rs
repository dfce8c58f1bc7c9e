use crate::kernelvec::kernelvec;
use crate::memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
use crate::param::KERNEL_STACK_PAGES;
use crate::plic;
use crate::println;
use crate::proc::{self, Channel, current_proc, current_proc_opt};
use crate::riscv::{
    PGSIZE, interrupts,
    registers::{satp, scause, sepc, sstatus, stimecmp, stval, stvec, time, tp},
};
use crate::spinlock::SpinLock;
use crate::syscall::syscall;
use crate::trampoline::{trampoline, userret, uservec};
use crate::uart;
use crate::virtio_disk;

/// clock tick interrupts since boot; the channel for sleep(n)
pub static TICKS: SpinLock<usize> = SpinLock::new(0, "time");

/// Handles an interrupt, exception, or system call from user space.
///
/// # Safety
/// Called from `uservec` in trampoline.rs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrap() {
    unsafe {
        assert!(
            (sstatus::read() & sstatus::SPP) == 0,
            "usertrap: not from user mode"
        );

        // we are in the kernel now: send interrupts and exceptions to
        // kerneltrap
        stvec::write(kernelvec as *const () as usize);

        let proc = current_proc();
        // # Safety: we are the current proc
        let data = proc.data_mut();

        // save the user program counter: this handler may yield to another
        // hart which enters user space and overwrites sepc.
        data.trapframe_mut().epc = sepc::read();

        let scause = scause::Scause::from(scause::read());
        let mut which_dev = None;

        match scause.cause() {
            scause::Trap::Exception(scause::Exception::EnvironmentCall) => {
                // system call
                if proc.is_killed() {
                    proc::exit(-1);
                }

                // sepc points to the ecall instruction; return to the next
                // instruction instead
                data.trapframe_mut().epc += 4;

                // an interrupt would clobber sepc, scause and sstatus, so
                // enable only now that we are done with those registers
                interrupts::enable();

                syscall(data.trapframe_mut());
            }

            scause::Trap::Exception(scause::Exception::StorePageFault)
            | scause::Trap::Exception(scause::Exception::LoadPageFault) => {
                let sp = data.trapframe().sp;
                let fault_addr = stval::read();
                let stack_low = data.stack_low.as_usize();

                // a fault between the stack pointer and the mapped stack is
                // the stack growing; provide one page if the stack pointer
                // is at most one page below the current bottom
                if sp <= fault_addr
                    && fault_addr < stack_low
                    && sp >= stack_low.saturating_sub(PGSIZE)
                {
                    if proc::grow_stack(proc).is_err() {
                        println!(
                            "usertrap: out of stack pid={:?} addr=0x{:X}",
                            proc.inner.lock().pid,
                            fault_addr,
                        );
                        proc.set_killed();
                    }
                } else {
                    println!(
                        "usertrap: page fault pid={:?} sepc=0x{:X} stval=0x{:X}",
                        proc.inner.lock().pid,
                        sepc::read(),
                        fault_addr,
                    );
                    proc.set_killed();
                }
            }

            scause::Trap::Interrupt(intr)
                if {
                    which_dev = dev_intr(intr);
                    which_dev.is_some()
                } =>
            {
                // handled in dev_intr
            }

            _ => {
                println!(
                    "usertrap: unexpected scause=0x{:X} pid={:?} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    proc.inner.lock().pid,
                    sepc::read(),
                    stval::read(),
                );
                proc.set_killed();
            }
        }

        if proc.is_killed() {
            proc::exit(-1);
        }

        // a timer interrupt means this process used up its slice
        if which_dev == Some(InterruptType::Timer) {
            proc::r#yield();
        }

        usertrapret();
    }
}

/// Returns to user space through the trampoline.
///
/// # Safety
/// Must be called on a process's kernel stack as the last step of a trap
/// (or from fork_ret).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usertrapret() {
    let proc = current_proc();

    // we're about to switch the destination of traps from kerneltrap to
    // usertrap; disable interrupts until we're back in user space where
    // usertrap is the right place
    interrupts::disable();

    // send syscalls, interrupts and exceptions to uservec
    let trampoline_uservec =
        TRAMPOLINE + (uservec as *const () as usize - trampoline as *const () as usize);
    unsafe { stvec::write(trampoline_uservec) };

    // values uservec needs when the process next traps into the kernel
    // # Safety: we are the current proc
    let data = unsafe { proc.data_mut() };
    let trapframe = data.trapframe_mut();
    trapframe.kernel_satp = unsafe { satp::read() };
    trapframe.kernel_sp = (data.kstack + KERNEL_STACK_PAGES * PGSIZE).as_usize();
    trapframe.kernel_trap = usertrap as *const () as usize;
    trapframe.kernel_hartid = unsafe { tp::read() };

    // set up the registers trampoline's sret will use

    // set previous privilege to user, with interrupts enabled there
    let mut x = unsafe { sstatus::read() };
    x &= !sstatus::SPP;
    x |= sstatus::SPIE;
    unsafe { sstatus::write(x) };

    // the saved user pc
    unsafe { sepc::write(trapframe.epc) };

    let user_satp = satp::make(data.pagetable().as_pa().as_usize());

    // jump to userret at the top of memory, which switches to the user page
    // table, restores user registers, and srets to user mode
    unsafe {
        let trampoline_userret =
            TRAMPOLINE + (userret as *const () as usize - trampoline as *const () as usize);
        let trampoline_userret: extern "C" fn(usize) -> ! =
            core::mem::transmute(trampoline_userret);
        trampoline_userret(user_satp);
    }
}

/// Interrupts and exceptions from kernel code come here via kernelvec, on
/// whatever the current kernel stack is.
///
/// # Safety
/// Called from `kernelvec`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kerneltrap() {
    unsafe {
        let saved_sepc = sepc::read();
        let saved_sstatus = sstatus::read();
        let scause = scause::Scause::from(scause::read());

        assert!(
            saved_sstatus & sstatus::SPP != 0,
            "kerneltrap: not from supervisor mode"
        );
        assert!(!interrupts::get(), "kerneltrap: interrupts enabled");

        let which_dev;

        // exceptions in supervisor mode, and interrupts from unknown
        // sources, are fatal
        match scause.cause() {
            scause::Trap::Interrupt(intr)
                if {
                    which_dev = dev_intr(intr);
                    which_dev.is_some()
                } => {}

            _ => {
                println!(
                    "scause=0x{:X} sepc=0x{:X} stval=0x{:X}",
                    scause.bits(),
                    sepc::read(),
                    stval::read()
                );
                panic!("kerneltrap");
            }
        }

        // on a timer interrupt, give up the CPU if a process is running
        if which_dev == Some(InterruptType::Timer) && current_proc_opt().is_some() {
            proc::r#yield();
        }

        // the yield may have caused traps, so restore the registers
        // kernelvec's sret needs
        sepc::write(saved_sepc);
        sstatus::write(saved_sstatus);
    }
}

/// Handles a clock interrupt. Ticks advance on hart 0 only.
fn clock_intr() {
    let _lock = proc::lock_current_cpu();
    let hart = unsafe { proc::current_id() };

    if hart == 0 {
        let mut ticks = TICKS.lock();
        *ticks += 1;
        proc::wakeup(Channel::Ticks);
    }

    // ask for the next timer interrupt; this also clears the current one.
    // 1_000_000 cycles is about a tenth of a second on qemu.
    unsafe { stimecmp::write(time::read() + 1_000_000) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptType {
    Device,
    Timer,
}

/// Checks whether the interrupt is an external device or the timer, and
/// dispatches it.
fn dev_intr(intr: scause::Interrupt) -> Option<InterruptType> {
    match intr {
        // supervisor external interrupt, via the PLIC
        scause::Interrupt::SupervisorExternal => {
            let irq = plic::claim();

            match irq as usize {
                UART0_IRQ => uart::handle_interrupt(),
                VIRTIO0_IRQ => virtio_disk::handle_interrupt(),
                0 => {}
                _ => println!("unexpected interrupt irq={}", irq),
            }

            if irq != 0 {
                plic::complete(irq);
            }

            Some(InterruptType::Device)
        }

        scause::Interrupt::SupervisorTimer => {
            clock_intr();
            Some(InterruptType::Timer)
        }

        _ => None,
    }
}

/// Sets up to take exceptions and traps while in the kernel.
///
/// # Safety
/// Must be called once per hart during initialization.
pub unsafe fn init_hart() {
    unsafe { stvec::write(kernelvec as *const () as usize) };
}
