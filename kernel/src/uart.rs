use core::num::Wrapping;
use core::ptr;

use crate::console;
use crate::memlayout::UART0;
use crate::printf::PRINTF;
use crate::proc::{self, Channel, lock_current_cpu};
use crate::spinlock::SpinLock;

// UART control registers are memory-mapped at address UART0.
// http://byterunner.com/16550.html

/// Receive Holding Register (for input bytes)
const RHR: usize = 0;
/// Transmit Holding Register (for output bytes)
const THR: usize = 0;
/// Interrupt Enable Register
const IER: usize = 1;
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
/// FIFO Control Register
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// clear the content of the two FIFOs
const FCR_FIFO_CLEAR: u8 = 3 << 1;
/// Interrupt Status Register
const ISR: usize = 2;
/// Line Control Register
const LCR: usize = 3;
const LCR_EIGHT_BITS: u8 = 3;
/// special mode to set the baud rate
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Line Status Register
const LSR: usize = 5;
/// input is waiting to be read from RHR
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character to send
const LSR_TX_IDLE: u8 = 1 << 5;

pub static UART: SpinLock<Uart> = SpinLock::new(Uart::new(UART0), "uart");

const UART_TX_BUF_SIZE: usize = 32;

/// 16550 driver state: the mmio base plus an output ring drained by the
/// transmit interrupt.
#[derive(Debug)]
pub struct Uart {
    base_address: usize,
    tx_buf: [u8; UART_TX_BUF_SIZE],
    tx_w: Wrapping<usize>,
    tx_r: Wrapping<usize>,
}

impl Uart {
    pub const fn new(base_address: usize) -> Self {
        Self {
            base_address,
            tx_buf: [0; UART_TX_BUF_SIZE],
            tx_w: Wrapping(0),
            tx_r: Wrapping(0),
        }
    }

    fn read(&self, reg: usize) -> u8 {
        // Safety: reading a memory-mapped UART register
        unsafe { ptr::read_volatile((self.base_address as *const u8).add(reg)) }
    }

    fn write(&mut self, reg: usize, value: u8) {
        // Safety: writing a memory-mapped UART register
        unsafe { ptr::write_volatile((self.base_address as *mut u8).add(reg), value) }
    }

    /// Initializes the UART to 38.4K baud, 8 data bits, no parity, one stop
    /// bit.
    fn init(&mut self) {
        // disable interrupts
        self.write(IER, 0x00);

        // special mode to set the baud rate
        self.write(LCR, LCR_BAUD_LATCH);

        // LSB and MSB for a baud rate of 38.4K
        self.write(0, 0x03);
        self.write(1, 0x00);

        // leave set-baud mode, 8 data bits
        self.write(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs
        self.write(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // enable transmit and receive interrupts
        self.write(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }

    /// Pushes waiting output into the transmit register if the UART is idle.
    /// Caller must hold the uart lock.
    fn start(&mut self) {
        loop {
            if self.tx_w == self.tx_r {
                // transmit buffer is empty; clear a pending tx interrupt
                self.read(ISR);
                return;
            }

            if (self.read(LSR) & LSR_TX_IDLE) == 0 {
                // the holding register is full; it will interrupt when it
                // is ready for a new byte
                return;
            }

            let c = self.tx_buf[self.tx_r.0 % UART_TX_BUF_SIZE];
            self.tx_r += 1;

            // a putc() may be waiting for space in the buffer
            proc::wakeup(Channel::Buffer(&raw const UART as usize));

            self.write(THR, c);
        }
    }
}

/// Adds a character to the output buffer and kicks the UART, sleeping if the
/// buffer is full. Because it may sleep, it cannot be used from interrupt
/// context; console output uses `putc_sync` instead.
pub fn putc(c: u8) {
    let mut uart = UART.lock();

    if PRINTF.is_panicked() {
        #[allow(clippy::empty_loop)]
        loop {}
    }

    while uart.tx_w == uart.tx_r + Wrapping(UART_TX_BUF_SIZE) {
        // buffer is full; wait for start() to open up space
        uart = proc::sleep(Channel::Buffer(&raw const UART as usize), uart);
    }

    let index = uart.tx_w.0 % UART_TX_BUF_SIZE;
    uart.tx_buf[index] = c;
    uart.tx_w += 1;
    uart.start();
}

/// Synchronously waits for the transmit register and sends one character.
/// Used by the kernel printf and to echo input; safe in interrupt context.
pub fn putc_sync(c: u8) {
    let _intr = lock_current_cpu();

    if PRINTF.is_panicked() {
        #[allow(clippy::empty_loop)]
        loop {}
    }

    // # Safety: single byte mmio writes; serialized well enough by the
    // printf lock in the non-panicked case
    let uart = unsafe { UART.get_mut_unchecked() };

    while (uart.read(LSR) & LSR_TX_IDLE) == 0 {
        core::hint::spin_loop();
    }

    uart.write(THR, c);
}

/// Reads one input character, or None if none is waiting.
fn getc() -> Option<u8> {
    let uart = UART.lock();

    if uart.read(LSR) & LSR_RX_READY != 0 {
        Some(uart.read(RHR))
    } else {
        None
    }
}

/// Handles a uart interrupt: either input has arrived or the device is
/// ready for more output (or both).
pub fn handle_interrupt() {
    // read and process incoming characters
    while let Some(c) = getc() {
        console::handle_interrupt(c);
    }

    // send buffered characters
    let mut uart = UART.lock();
    uart.start();
}

/// Initializes the device.
///
/// # Safety
/// Must be called once, before the first console output.
pub unsafe fn init() {
    let mut uart = UART.lock();
    uart.init();
}
