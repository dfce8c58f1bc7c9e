use crate::error::KernelError;
use crate::proc::{self, Addr, Channel, PROCS};
use crate::spinlock::SpinLock;
use crate::uart;

/// Translate character to control-key equivalent.
const fn ctrl(c: u8) -> u8 {
    c.wrapping_sub(b'@')
}

const BACKSPACE: u8 = ctrl(b'H');
const DELETE: u8 = b'\x7f';
const END_OF_FILE: u8 = ctrl(b'D');
const KILL_LINE: u8 = ctrl(b'U');
const PRINT_PROCS: u8 = ctrl(b'P');

const INPUT_BUF_SIZE: usize = 128;

pub static CONSOLE: SpinLock<Console> = SpinLock::new(Console::new(), "console");

/// Console input line discipline.
///
/// Input arrives via the uart interrupt one character at a time and is
/// buffered until a whole line (or EOF) is available; readers sleep on the
/// buffer until then.
pub struct Console {
    buf: [u8; INPUT_BUF_SIZE],
    /// read index
    r: usize,
    /// write index (end of completed input)
    w: usize,
    /// edit index (current editing position)
    e: usize,
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    fn putc(c: u8) {
        uart::putc_sync(c);
    }

    /// Erases the character before the cursor.
    fn put_backspace() {
        Self::putc(b'\x08');
        Self::putc(b' ');
        Self::putc(b'\x08');
    }

    /// User write()s to the console come here.
    pub fn write(src: Addr, n: usize) -> Result<usize, KernelError> {
        for i in 0..n {
            let mut c = [0u8];
            if proc::either_copy_in(&mut c, src.offset(i)).is_err() {
                return Ok(i);
            }
            uart::putc(c[0]);
        }

        Ok(n)
    }

    /// User read()s from the console come here.
    /// Copies a whole input line (at most `n` bytes) to `dst`.
    pub fn read(dst: Addr, n: usize) -> Result<usize, KernelError> {
        let mut console = CONSOLE.lock();

        let mut dst = dst;
        let target = n;
        let mut n = n;

        while n > 0 {
            // wait until the interrupt handler has put some input into the
            // buffer
            while console.r == console.w {
                if proc::current_proc().is_killed() {
                    err!(KernelError::NotPermitted);
                }

                console = proc::sleep(Channel::Buffer(&raw const CONSOLE as usize), console);
            }

            let c = console.buf[console.r % INPUT_BUF_SIZE];
            console.r += 1;

            if c == END_OF_FILE {
                if n < target {
                    // save ^D for next time, so the caller gets a 0-byte
                    // result on the next read
                    console.r -= 1;
                }
                break;
            }

            if proc::either_copy_out(dst, &[c]).is_err() {
                break;
            }

            dst = dst.offset(1);
            n -= 1;

            if c == b'\n' {
                // a whole line has arrived
                break;
            }
        }

        Ok(target - n)
    }
}

/// Console input interrupt handler; `uart::handle_interrupt()` calls this
/// for each input character. Does erase/kill processing and wakes up
/// read() when a whole line has arrived.
pub fn handle_interrupt(c: u8) {
    let mut console = CONSOLE.lock();

    match c {
        PRINT_PROCS => {
            PROCS.dump();
        }

        KILL_LINE => {
            while console.e != console.w
                && console.buf[(console.e - 1) % INPUT_BUF_SIZE] != b'\n'
            {
                console.e -= 1;
                Console::put_backspace();
            }
        }

        BACKSPACE | DELETE => {
            if console.e != console.w {
                console.e -= 1;
                Console::put_backspace();
            }
        }

        mut c => {
            if c != 0 && console.e - console.r < INPUT_BUF_SIZE {
                if c == b'\r' {
                    c = b'\n';
                }

                // echo back to the user
                Console::putc(c);

                // store for consumption by read()
                let index = console.e % INPUT_BUF_SIZE;
                console.buf[index] = c;
                console.e += 1;

                if c == b'\n' || c == END_OF_FILE || console.e - console.r == INPUT_BUF_SIZE {
                    // wake up read() if a whole line (or EOF) has arrived
                    console.w = console.e;
                    proc::wakeup(Channel::Buffer(&raw const CONSOLE as usize));
                }
            }
        }
    }
}

/// Initializes the console.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    unsafe { uart::init() };
}
