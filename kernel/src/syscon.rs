use core::ptr;

use crate::memlayout::SYSCON;

// sifive test device magic values, from qemu's hw/misc/sifive_test.c
const POWER_OFF: u32 = 0x5555;
const REBOOT: u32 = 0x7777;

pub fn power_off() -> ! {
    unsafe { ptr::write_volatile(SYSCON as *mut u32, POWER_OFF) };
    unreachable!("syscon power off");
}

pub fn restart() -> ! {
    unsafe { ptr::write_volatile(SYSCON as *mut u32, REBOOT) };
    unreachable!("syscon restart");
}
