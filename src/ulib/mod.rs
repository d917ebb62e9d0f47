// User-mode runtime.
//
// Everything here runs in ring 3 and talks to the kernel only through
// the thirteen system-call primitives; fork, copy-on-write and blocking
// IPC are built on top of them. Each environment finds "self" in the
// read-only env table the kernel maps at UENVS.

pub mod fork;
pub mod ipc;
pub mod pgfault;
pub mod syscall;

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::env::{Env, NENV};

static THISENV: AtomicUsize = AtomicUsize::new(0);

/// The caller's own record in the UENVS window. Call set_thisenv after
/// anything that changes which env "self" is (i.e. in a fresh exofork
/// child).
pub(crate) fn thisenv() -> &'static Env {
    let p = THISENV.load(Ordering::Relaxed) as *const Env;
    unsafe { p.as_ref().expect("thisenv before libmain") }
}

pub(crate) fn set_thisenv() {
    let id = syscall::sys_getenvid() as u32 as usize;
    THISENV.store(crate::env::uenv_va(id & (NENV - 1)).0, Ordering::Relaxed);
}

/// Entry glue for user programs: resolve self, run the program, exit.
pub fn libmain(umain: fn()) -> ! {
    set_thisenv();
    umain();
    exit()
}

pub fn exit() -> ! {
    syscall::sys_env_destroy(0);
    unreachable!("the kernel reaped this env");
}

// Buffered console output over sys_cputs, so one formatted line
// reaches the kernel as one write.
struct ConsoleOut {
    buf: [u8; 256],
    len: usize,
}

impl ConsoleOut {
    const fn new() -> ConsoleOut {
        ConsoleOut {
            buf: [0; 256],
            len: 0,
        }
    }

    fn flush(&mut self) {
        if self.len > 0 {
            syscall::sys_cputs(&self.buf[..self.len]);
            self.len = 0;
        }
    }
}

impl fmt::Write for ConsoleOut {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.len == self.buf.len() {
                self.flush();
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn uprint(args: fmt::Arguments) {
    use fmt::Write;

    let mut out = ConsoleOut::new();
    let _ = out.write_fmt(args);
    out.flush();
}

#[macro_export]
macro_rules! uprint {
    ($($arg:tt)*) => {
        $crate::ulib::uprint(format_args!($($arg)*))
    }
}

#[macro_export]
macro_rules! uprintln {
    () => ($crate::uprint!("\n"));
    ($($arg:tt)*) => {
        $crate::uprint!("{}\n", format_args!($($arg)*));
    }
}

/// Report an unrecoverable user-level error and give up the env.
#[doc(hidden)]
pub fn upanic(args: fmt::Arguments) -> ! {
    uprint(format_args!("user panic: "));
    uprint(args);
    uprint(format_args!("\n"));
    exit()
}

#[macro_export]
macro_rules! upanic {
    ($($arg:tt)*) => {
        $crate::ulib::upanic(format_args!($($arg)*))
    }
}
