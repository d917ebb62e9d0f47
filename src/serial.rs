// 16550 UART driver for COM1.
// ref. https://wiki.osdev.org/Serial_Ports

use core::fmt;

use spin::Once;

use crate::spinlock::{Mutex, MutexGuard};
use crate::x86;

static SERIAL: Once<Mutex<Serial>> = Once::new();

pub(crate) struct Serial {
    serial_exists: bool,
}

pub(crate) fn serial() -> MutexGuard<'static, Serial> {
    SERIAL
        .call_once(|| {
            // Turn off the FIFO
            x86::outb(COM1 + COM_FCR, 0);

            // Set speed; requires DLAB latch
            x86::outb(COM1 + COM_LCR, COM_LCR_DLAB);
            x86::outb(COM1 + COM_DLL, 12); // 115200 / 9600
            x86::outb(COM1 + COM_DLM, 0);

            // 8 data bits, 1 stop bit, parity off; turn off DLAB latch
            x86::outb(COM1 + COM_LCR, COM_LCR_WLEN8 & !COM_LCR_DLAB);

            // No modem controls
            x86::outb(COM1 + COM_MCR, 0);

            // Enable rcv interrupts
            x86::outb(COM1 + COM_IER, COM_IER_RDI);

            // Clear any preexisting overrun indications and interrupts.
            // The serial port doesn't exist if COM_LSR returns 0xFF.
            let serial_exists = x86::inb(COM1 + COM_LSR) != 0xff;
            x86::inb(COM1 + COM_IIR);
            x86::inb(COM1 + COM_RX);

            Mutex::new("serial", Serial { serial_exists })
        })
        .lock()
}

const COM1: u16 = 0x3f8;

const COM_RX: u16 = 0; // In: Receive buffer (DLAB=0)
const COM_TX: u16 = 0; // Out: Transmit buffer (DLAB=0)
const COM_DLL: u16 = 0; // Out: Divisor Latch Low (DLAB=1)
const COM_DLM: u16 = 1; // Out: Divisor Latch High (DLAB=1)
const COM_IER: u16 = 1; // Out: Interrupt Enable Register
const COM_IER_RDI: u8 = 0x01; // Enable receiver data interrupt
const COM_IIR: u16 = 2; // In: Interrupt ID Register
const COM_FCR: u16 = 2; // Out: FIFO Control Register
const COM_LCR: u16 = 3; // Out: Line Control Register
const COM_LCR_DLAB: u8 = 0x80; // Divisor latch access bit
const COM_LCR_WLEN8: u8 = 0x03; // Wordlength: 8 bits
const COM_MCR: u16 = 4; // Out: Modem Control Register
const COM_LSR: u16 = 5; // In: Line Status Register
const COM_LSR_DATA: u8 = 0x01; // Data available
const COM_LSR_TXRDY: u8 = 0x20; // Transmit buffer avail

impl Serial {
    // Stupid I/O delay routine necessitated by historical PC design flaws
    fn delay(&self) {
        x86::inb(0x84);
        x86::inb(0x84);
        x86::inb(0x84);
        x86::inb(0x84);
    }

    /// Fetch one received byte, if any.
    pub(crate) fn proc_data(&self) -> Option<u8> {
        if x86::inb(COM1 + COM_LSR) & COM_LSR_DATA == 0 {
            None
        } else {
            Some(x86::inb(COM1 + COM_RX))
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.serial_exists
    }

    fn putc(&self, c: u8) {
        for _ in 0..12800 {
            if x86::inb(COM1 + COM_LSR) & COM_LSR_TXRDY != 0 {
                break;
            }
            self.delay();
        }
        x86::outb(COM1 + COM_TX, c);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.putc(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub(crate) fn _print(args: fmt::Arguments) {
    use fmt::Write;

    // The UART accepts whatever we feed it.
    let _ = serial().write_fmt(args);
}
