use core::fmt::{self, Write};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::proc;
use crate::spinlock::SpinLock;
use crate::uart;

pub static PRINTF: Printf = Printf {
    writer: SpinLock::new(Writer, "printf"),
    locking: AtomicBool::new(true),
    panicked: AtomicBool::new(false),
};

pub struct Printf {
    writer: SpinLock<Writer>,
    locking: AtomicBool,
    panicked: AtomicBool,
}

impl Printf {
    /// Set once any hart panics; the uart uses it to stop sleeping on the
    /// transmit buffer so the panic message always makes it out.
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Relaxed)
    }
}

pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            uart::putc_sync(byte);
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments<'_>, newline: bool) {
    if PRINTF.locking.load(Ordering::Relaxed) {
        let mut writer = PRINTF.writer.lock();

        writer.write_fmt(args).expect("print error");
        if newline {
            writer.write_char('\n').expect("print error");
        }
    } else {
        // panicked; the lock no longer matters
        unsafe {
            let writer = PRINTF.writer.get_mut_unchecked();

            let _ = writer.write_fmt(args);
            if newline {
                let _ = writer.write_char('\n');
            }
        }
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::printf::_print(format_args!($($arg)*), false);
    }};
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {{
        $crate::printf::_print(format_args!($($arg)*), true);
    }};
}

pub fn handle_panic(info: &PanicInfo<'_>) -> ! {
    PRINTF.locking.store(false, Ordering::Relaxed);

    let cpu_id = unsafe { proc::current_id() };
    println!("hart {cpu_id} {info}");

    PRINTF.panicked.store(true, Ordering::Relaxed);

    // debug builds spin so the machine state can be inspected from the
    // monitor; release builds shut down
    #[cfg(not(debug_assertions))]
    crate::syscon::power_off();

    #[cfg(debug_assertions)]
    #[allow(clippy::empty_loop)]
    loop {}
}
