// PS/2 keyboard input, polled from the IRQ handler.
// ref. https://wiki.osdev.org/PS/2_Keyboard
// ref. https://wiki.osdev.org/%228042%22_PS/2_Controller

use crate::x86;
use consts::*;

mod consts {
    pub(crate) const PORT_DATA: u16 = 0x60; // kbd data port (I)
    pub(crate) const PORT_STATUS: u16 = 0x64; // kbd controller status port (I)

    // Status register flags
    pub(crate) const STATUS_FL_DIB: u8 = 0x01; // data in buffer
}

// Scan code set 1, unshifted, no modifier handling; enough for the
// kernel console.
#[rustfmt::skip]
static NORMAL_MAP: [u8; 0x60] = [
    0,    0x1b, b'1', b'2', b'3', b'4', b'5', b'6', // 0x00
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', // 0x10
    b'o', b'p', b'[', b']', b'\n', 0,   b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', // 0x20
    b'\'', b'`', 0,   b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0,    b'*', // 0x30
    0,    b' ', 0,    0,    0,    0,    0,    0,
    0,    0,    0,    0,    0,    0,    0,    b'7', // 0x40
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', 0,    0,    0,    0,    // 0x50
    0,    0,    0,    0,    0,    0,    0,    0,
];

/// Fetch one character from the keyboard, or None if no input (or an
/// unhandled scan code) is pending.
pub(crate) fn kbd_getc() -> Option<u8> {
    if x86::inb(PORT_STATUS) & STATUS_FL_DIB == 0 {
        return None;
    }

    let data = x86::inb(PORT_DATA);
    if data & 0x80 != 0 {
        // key release
        return None;
    }

    match NORMAL_MAP.get(data as usize) {
        Some(&c) if c != 0 => Some(c),
        _ => None,
    }
}
