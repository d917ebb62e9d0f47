// Kernel console: print macros fanning out to VGA and serial, and a
// small input ring fed by the keyboard and serial IRQ handlers.

use core::fmt;

use crate::spinlock::{Mutex, MutexGuard};
use crate::{kbd, serial};

#[cfg(target_os = "none")]
use crate::constants::KERNBASE;
#[cfg(target_os = "none")]
use crate::trap::consts::{IRQ_KBD, IRQ_SERIAL};
#[cfg(target_os = "none")]
use crate::{picirq, vga_buffer};

static CONSOLE_LOCK: Mutex<()> = Mutex::new("console", ());

#[cfg(target_os = "none")]
pub(crate) fn print(args: fmt::Arguments) {
    let _lock = CONSOLE_LOCK.lock();
    vga_buffer::_print(args);
    serial::_print(args);
}

#[cfg(not(target_os = "none"))]
pub(crate) fn print(args: fmt::Arguments) {
    let _lock = CONSOLE_LOCK.lock();
    #[cfg(test)]
    std::print!("{}", args);
    #[cfg(not(test))]
    let _ = args;
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    }
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*));
    }
}

const INPUT_BUF: usize = 128;

struct Input {
    buf: [u8; INPUT_BUF],
    r: usize, // read index
    w: usize, // write index
}

impl Input {
    const fn new() -> Input {
        Input {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
        }
    }

    fn push(&mut self, c: u8) {
        if self.w - self.r < INPUT_BUF {
            self.buf[self.w % INPUT_BUF] = c;
            self.w += 1;
        }
    }

    fn pop(&mut self) -> Option<u8> {
        if self.r == self.w {
            None
        } else {
            let c = self.buf[self.r % INPUT_BUF];
            self.r += 1;
            Some(c)
        }
    }
}

static INPUT: Mutex<Input> = Mutex::new("console_input", Input::new());

fn input() -> MutexGuard<'static, Input> {
    INPUT.lock()
}

/// Non-blocking console read; 0 means no input is waiting.
pub(crate) fn cons_getc() -> u8 {
    // Poll once in case the IRQ handlers have not run (e.g. input that
    // arrived while interrupts were disabled).
    kbd_intr();
    serial_intr();

    input().pop().unwrap_or(0)
}

pub(crate) fn kbd_intr() {
    while let Some(c) = kbd::kbd_getc() {
        input().push(c);
    }
}

pub(crate) fn serial_intr() {
    let serial = serial::serial();
    if !serial.exists() {
        return;
    }
    while let Some(c) = serial.proc_data() {
        input().push(c);
    }
}

/// Bring up the console devices and route their IRQs.
#[cfg(target_os = "none")]
pub(crate) fn console_init() {
    vga_buffer::init_writer((KERNBASE + 0xb8000) as *mut vga_buffer::Buffer);

    let serial_exists = serial::serial().exists();
    picirq::unmask_8259a(IRQ_KBD);
    picirq::unmask_8259a(IRQ_SERIAL);

    if !serial_exists {
        log::warn!("serial port does not exist");
    }
}

#[cfg(test)]
mod tests {
    use super::Input;

    #[test]
    fn input_ring_orders_and_bounds() {
        let mut input = Input::new();
        assert_eq!(input.pop(), None);

        for c in 0..200u8 {
            input.push(c);
        }
        // Ring capacity caps retained input; order is preserved.
        assert_eq!(input.pop(), Some(0));
        assert_eq!(input.pop(), Some(1));
        let mut last = 1;
        while let Some(c) = input.pop() {
            last = c;
        }
        assert_eq!(last, 127);
    }
}
