use core::ptr;

use crate::memlayout::RTC0;

// goldfish RTC registers, nanoseconds since the unix epoch
const TIME_LOW: usize = 0x00;
const TIME_HIGH: usize = 0x04;

/// Reads the wall clock. Low word first; the device latches the high word
/// on the low read.
pub fn read_ns() -> u64 {
    unsafe {
        let low = ptr::read_volatile((RTC0 + TIME_LOW) as *const u32) as u64;
        let high = ptr::read_volatile((RTC0 + TIME_HIGH) as *const u32) as u64;
        (high << 32) | low
    }
}

/// Seconds since the unix epoch.
pub fn read_seconds() -> i64 {
    (read_ns() / 1_000_000_000) as i64
}
