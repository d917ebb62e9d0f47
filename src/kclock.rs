// MC146818 real-time clock / CMOS NVRAM access.
// ref. https://wiki.osdev.org/CMOS

use crate::x86;

const IO_RTC: u16 = 0x70;

// Start of NVRAM: offset 14.
const MC_NVRAM_START: u8 = 0xe;

// base memory size
pub(crate) const NVRAM_BASELO: u8 = MC_NVRAM_START + 7;

// extended memory size (between 1MB and 16MB)
pub(crate) const NVRAM_EXTLO: u8 = MC_NVRAM_START + 9;

// extended memory size (between 16MB and 4GB)
pub(crate) const NVRAM_EXT16LO: u8 = MC_NVRAM_START + 38;

/// Read an NVRAM register value from the real-time clock.
pub(crate) fn mc146818_read(reg: u8) -> u8 {
    x86::outb(IO_RTC, reg);
    x86::inb(IO_RTC + 1)
}

/// Write an NVRAM register value.
#[cfg(target_os = "none")]
pub(crate) fn mc146818_write(reg: u8, datum: u8) {
    x86::outb(IO_RTC, reg);
    x86::outb(IO_RTC + 1, datum);
}
